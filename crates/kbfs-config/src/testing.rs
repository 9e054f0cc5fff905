//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - An isolated HOME and project directory, so no real config is read
//! - A unique device image path
//!
//! # Usage
//!
//! ```ignore
//! use kbfs_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     // env.image_path is unique; the image itself is not created
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::{Config, ENV_DEVICE};

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Stand-in home directory for the global config
    pub home: PathBuf,
    /// Working directory for the project config
    pub project_root: PathBuf,
    /// Device image for this test
    pub image_path: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let home = root.join("home");
        let project_root = root.join("project");
        std::fs::create_dir_all(&home)?;
        std::fs::create_dir_all(&project_root)?;

        let image_path = root.join(format!("kbfs-test-{}.img", test_id));

        Ok(Self {
            _temp_dir: temp_dir,
            home,
            project_root,
            image_path,
            test_id,
        })
    }

    /// Project config path inside the environment
    pub fn project_config_path(&self) -> PathBuf {
        self.project_root.join(".kbfs").join("config.toml")
    }

    /// Global config path inside the stand-in home
    pub fn global_config_path(&self) -> PathBuf {
        self.home.join(".kbfs").join("config.toml")
    }

    /// Default config pointed at this environment's image
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.device.path = Some(self.image_path.clone());
        cfg
    }

    /// Write `cfg` as the project config
    pub fn write_project_config(&self, cfg: &Config) -> anyhow::Result<PathBuf> {
        let path = self.project_config_path();
        cfg.save(&path)?;
        Ok(path)
    }

    /// Create a file under the project root
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.project_root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Environment variables for spawning the CLI inside this environment.
    pub fn cli_env(&self) -> Vec<(String, String)> {
        vec![
            ("HOME".to_string(), self.home.display().to_string()),
            (
                ENV_DEVICE.to_string(),
                self.image_path.display().to_string(),
            ),
        ]
    }
}
