mod env;
pub mod settings;

pub use settings::{
    CloudConfig, DriveSettings, HttpSettings, PubSubSettings, StorageSettings, TasksSettings,
    DRIVE_SCOPE,
};
