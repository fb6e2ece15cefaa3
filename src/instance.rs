//! Local instance identity.
//!
//! Layout under `work_dir`:
//! ```text
//! .chedir/
//! ├── id            (uuid v4, one line)
//! └── workspaces/   (per-workspace cache)
//! ```
//!
//! The id is created once and reused, so repeated `init` calls are harmless.

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::AppError;

const ID_FILE: &str = "id";
const WORKSPACES_DIR: &str = "workspaces";

#[derive(Debug, Clone)]
pub struct Instance {
    pub instance_id: String,
    pub work_dir: PathBuf,
}

impl Instance {
    pub fn workspaces_dir(&self) -> PathBuf {
        self.work_dir.join(WORKSPACES_DIR)
    }
}

/// `true` if `work_dir` already holds an instance id.
pub fn is_initialized(work_dir: &Path) -> bool {
    work_dir.join(ID_FILE).is_file()
}

/// Load or create the instance under `work_dir`.
pub fn setup(work_dir: &Path) -> Result<Instance, AppError> {
    fs::create_dir_all(work_dir.join(WORKSPACES_DIR)).map_err(|e| {
        AppError::Instance(format!("cannot create {}: {e}", work_dir.display()))
    })?;

    let instance_id = match load(work_dir)? {
        Some(id) => {
            debug!(%id, "instance id loaded");
            id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            fs::write(work_dir.join(ID_FILE), format!("{id}\n"))
                .map_err(|e| AppError::Instance(format!("cannot write instance id: {e}")))?;
            info!(%id, dir = %work_dir.display(), "instance initialized");
            id
        }
    };

    Ok(Instance {
        instance_id,
        work_dir: work_dir.to_path_buf(),
    })
}

/// Read the existing instance id, if any.
pub fn load(work_dir: &Path) -> Result<Option<String>, AppError> {
    let path = work_dir.join(ID_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)
        .map_err(|e| AppError::Instance(format!("cannot read {}: {e}", path.display())))?;
    let id = raw.trim();
    Uuid::parse_str(id)
        .map_err(|e| AppError::Instance(format!("corrupt instance id in {}: {e}", path.display())))?;
    Ok(Some(id.to_string()))
}
