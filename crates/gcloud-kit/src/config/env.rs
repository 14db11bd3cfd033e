use std::path::PathBuf;

use super::settings::{CloudConfig, DriveSettings, PubSubSettings, StorageSettings, TasksSettings};

impl CloudConfig {
    /// Build a configuration from environment variables.
    ///
    /// A backend section is present only when all of its required variables
    /// are set and non-empty:
    ///
    /// * Pub/Sub: `PUBSUB_KEY_FILE`, `PUBSUB_PROJECT_ID` (optional
    ///   `PUBSUB_EMULATOR_HOST`)
    /// * Storage: `STORAGE_KEY`, `STORAGE_BUCKET`
    /// * Tasks: `TASKS_KEY_FILE`, else `STORAGE_KEY`, else
    ///   `GOOGLE_APPLICATION_CREDENTIALS`
    /// * Drive: `DRIVE_APP_NAME`, `DRIVE_CREDENTIALS`, `DRIVE_TOKEN_PATH`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let pubsub = match (var("PUBSUB_KEY_FILE"), var("PUBSUB_PROJECT_ID")) {
            (Some(key), Some(project)) => {
                let settings = PubSubSettings::new(PathBuf::from(key), project);
                Some(match var("PUBSUB_EMULATOR_HOST") {
                    Some(host) => settings.with_endpoint(emulator_url(&host)),
                    None => settings,
                })
            }
            _ => None,
        };

        let storage = match (var("STORAGE_KEY"), var("STORAGE_BUCKET")) {
            (Some(key), Some(bucket)) => Some(StorageSettings::new(PathBuf::from(key), bucket)),
            _ => None,
        };

        let tasks = var("TASKS_KEY_FILE")
            .or_else(|| var("STORAGE_KEY"))
            .or_else(|| var("GOOGLE_APPLICATION_CREDENTIALS"))
            .map(|key| TasksSettings::new(PathBuf::from(key)));

        let drive = match (
            var("DRIVE_APP_NAME"),
            var("DRIVE_CREDENTIALS"),
            var("DRIVE_TOKEN_PATH"),
        ) {
            (Some(app), Some(credentials), Some(token)) => Some(DriveSettings::new(
                app,
                PathBuf::from(credentials),
                PathBuf::from(token),
            )),
            _ => None,
        };

        Self {
            pubsub,
            storage,
            tasks,
            drive,
            ..Self::default()
        }
    }
}

fn emulator_url(host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> CloudConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CloudConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_empty_environment() {
        let config = config_from(&[]);
        assert!(config.pubsub.is_none());
        assert!(config.storage.is_none());
        assert!(config.tasks.is_none());
        assert!(config.drive.is_none());
    }

    #[test]
    fn test_partial_section_is_absent() {
        let config = config_from(&[("STORAGE_BUCKET", "media"), ("DRIVE_APP_NAME", "app")]);
        assert!(config.storage.is_none());
        assert!(config.drive.is_none());
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let config = config_from(&[("PUBSUB_KEY_FILE", "/k.json"), ("PUBSUB_PROJECT_ID", "  ")]);
        assert!(config.pubsub.is_none());
    }

    #[test]
    fn test_emulator_host() {
        let config = config_from(&[
            ("PUBSUB_KEY_FILE", "/k.json"),
            ("PUBSUB_PROJECT_ID", "proj"),
            ("PUBSUB_EMULATOR_HOST", "localhost:8085"),
        ]);
        let pubsub = config.pubsub.unwrap();
        assert_eq!(pubsub.endpoint.as_deref(), Some("http://localhost:8085"));
        assert_eq!(pubsub.project_id, "proj");
    }

    #[test]
    fn test_tasks_key_fallback_order() {
        let config = config_from(&[("GOOGLE_APPLICATION_CREDENTIALS", "/adc.json")]);
        assert_eq!(config.tasks.unwrap().key_file, PathBuf::from("/adc.json"));

        let config = config_from(&[
            ("GOOGLE_APPLICATION_CREDENTIALS", "/adc.json"),
            ("STORAGE_KEY", "/storage.json"),
        ]);
        assert_eq!(config.tasks.unwrap().key_file, PathBuf::from("/storage.json"));

        let config = config_from(&[
            ("STORAGE_KEY", "/storage.json"),
            ("TASKS_KEY_FILE", "/tasks.json"),
        ]);
        assert_eq!(config.tasks.unwrap().key_file, PathBuf::from("/tasks.json"));
    }

    #[test]
    fn test_full_drive_section() {
        let config = config_from(&[
            ("DRIVE_APP_NAME", "uploader"),
            ("DRIVE_CREDENTIALS", "/c.json"),
            ("DRIVE_TOKEN_PATH", "/t/token.json"),
        ]);
        let drive = config.drive.unwrap();
        assert_eq!(drive.app_name, "uploader");
        assert_eq!(drive.token_path, PathBuf::from("/t/token.json"));
    }
}
