use anyhow::{bail, Context, Result};
use pybox_core::Recipe;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Empty JSON object, the value type OCI uses for `Volumes`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// Runtime part of an OCI image config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageConfig {
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, Empty>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct ExporterConfig<'a> {
    #[serde(rename = "Config")]
    config: &'a ImageConfig,
    architecture: &'a str,
    os: &'a str,
}

impl ImageConfig {
    pub fn from_recipe(recipe: &Recipe) -> Self {
        Self {
            env: recipe.environment().to_env_list(),
            working_dir: recipe.workdir.clone(),
            entrypoint: recipe.entrypoint_command().argv(),
            cmd: Vec::new(),
            volumes: recipe
                .volumes
                .iter()
                .map(|v| (v.clone(), Empty {}))
                .collect(),
            labels: recipe.labels.clone(),
        }
    }

    /// `containerimage.config` exporter attribute: the config wrapped in `{"Config": ..}`
    /// together with the target OS and architecture.
    pub fn exporter_attr(&self, platform: &str) -> Result<String> {
        let (os, architecture) = match platform.split_once('/') {
            Some((os, arch)) if !os.is_empty() && !arch.is_empty() => (os, arch),
            _ => bail!("Invalid platform '{}', expected OS/ARCH", platform),
        };
        let document = ExporterConfig {
            config: self,
            architecture,
            os,
        };
        serde_json::to_string(&document).context("Failed to serialize image config")
    }

    /// Check a built image against this config.
    ///
    /// Entrypoint must match exactly with no default arguments, the working directory must
    /// match and every variable must be present with the same value; the base image may
    /// contribute extra variables.
    pub fn verify(
        &self,
        entrypoint: &[String],
        cmd: &[String],
        env: &[String],
        working_dir: &str,
    ) -> Result<()> {
        if entrypoint != self.entrypoint.as_slice() {
            bail!(
                "Image entrypoint {:?} does not match expected {:?}",
                entrypoint,
                self.entrypoint
            );
        }
        if !cmd.is_empty() {
            bail!("Image carries default arguments {:?}; expected none", cmd);
        }
        if working_dir != self.working_dir {
            bail!(
                "Image working directory '{}' does not match expected '{}'",
                working_dir,
                self.working_dir
            );
        }
        for expected in &self.env {
            if !env.contains(expected) {
                bail!("Image environment is missing {}", expected);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_from_default_recipe() {
        let config = ImageConfig::from_recipe(&Recipe::default());
        assert_eq!(config.entrypoint, strings(&["python", "-m", "app.main"]));
        assert!(config.cmd.is_empty());
        assert_eq!(config.working_dir, "/app");
        assert_eq!(
            config.env,
            strings(&["PYTHONDONTWRITEBYTECODE=1", "PYTHONUNBUFFERED=1"])
        );

    }

    #[test]
    fn test_exporter_attr() {
        let mut recipe = Recipe::default();
        recipe.env.insert("GREETING".to_string(), "hi".to_string());
        let attr = ImageConfig::from_recipe(&recipe)
            .exporter_attr("linux/arm64")
            .unwrap();

        let json: serde_json::Value = serde_json::from_str(&attr).unwrap();
        assert_eq!(json["os"], "linux");
        assert_eq!(json["architecture"], "arm64");
        let config = &json["Config"];
        assert_eq!(config["Entrypoint"], serde_json::json!(["python", "-m", "app.main"]));
        assert_eq!(config["WorkingDir"], "/app");
        assert_eq!(config["Cmd"], serde_json::json!([]));
        assert_eq!(
            config["Env"],
            serde_json::json!([
                "GREETING=hi",
                "PYTHONDONTWRITEBYTECODE=1",
                "PYTHONUNBUFFERED=1"
            ])
        );
        assert_eq!(config["Volumes"]["/logs"], serde_json::json!({}));
        assert!(config.get("Labels").is_none());

        assert!(ImageConfig::default().exporter_attr("linux").is_err());
    }

    #[test]
    fn test_verify() {
        let config = ImageConfig::from_recipe(&Recipe::default());
        let env = strings(&[
            "PATH=/usr/local/bin:/usr/bin",
            "PYTHONDONTWRITEBYTECODE=1",
            "PYTHONUNBUFFERED=1",
        ]);
        let entrypoint = strings(&["python", "-m", "app.main"]);

        config.verify(&entrypoint, &[], &env, "/app").unwrap();

        assert!(config
            .verify(&strings(&["python", "main.py"]), &[], &env, "/app")
            .is_err());
        assert!(config
            .verify(&entrypoint, &strings(&["--debug"]), &env, "/app")
            .is_err());
        assert!(config.verify(&entrypoint, &[], &env, "/srv").is_err());
        assert!(config
            .verify(&entrypoint, &[], &strings(&["PYTHONUNBUFFERED=1"]), "/app")
            .is_err());
    }
}
