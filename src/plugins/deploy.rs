//! Directory deployer: publishes a compiled database into a deploy root.
//!
//! Stands in for CDN/object-store publication. The `.deployed` marker is
//! the artifact the reconciler checks for the deploy stage.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use super::{CapabilityError, Deployer, Result};

pub struct DirectoryDeployer {
    deploy_dir: PathBuf,
}

impl DirectoryDeployer {
    pub fn new(deploy_dir: impl Into<PathBuf>) -> Self {
        Self {
            deploy_dir: deploy_dir.into(),
        }
    }

    fn marker_path(&self, site: &str) -> PathBuf {
        self.deploy_dir.join(site).join(".deployed")
    }
}

impl Deployer for DirectoryDeployer {
    fn name(&self) -> &str {
        "directory"
    }

    fn deploy(&self, site: &str, db_path: &Path) -> Result<()> {
        if !db_path.exists() {
            return Err(CapabilityError::Site(format!(
                "nothing to deploy: {} missing",
                db_path.display()
            )));
        }
        let target_dir = self.deploy_dir.join(site);
        fs::create_dir_all(&target_dir)
            .map_err(|e| CapabilityError::Fatal(format!("deploy dir: {e}")))?;

        // Copy to a temp name, then rename so readers never see a torn file
        let target = target_dir.join("meetings.db");
        let staging = target_dir.join("meetings.db.staging");
        fs::copy(db_path, &staging)
            .map_err(|e| CapabilityError::Transient(format!("stage database: {e}")))?;
        fs::rename(&staging, &target)
            .map_err(|e| CapabilityError::Transient(format!("publish database: {e}")))?;

        fs::write(self.marker_path(site), Utc::now().to_rfc3339())
            .map_err(|e| CapabilityError::Transient(format!("write marker: {e}")))?;
        Ok(())
    }

    fn is_deployed(&self, site: &str) -> bool {
        self.marker_path(site).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_deploy_copies_and_marks() {
        let storage = tempdir().unwrap();
        let deploy = tempdir().unwrap();
        let db = storage.path().join("meetings.db");
        fs::write(&db, b"sqlite bytes").unwrap();

        let deployer = DirectoryDeployer::new(deploy.path());
        assert!(!deployer.is_deployed("a.example"));
        deployer.deploy("a.example", &db).unwrap();
        assert!(deployer.is_deployed("a.example"));
        assert_eq!(
            fs::read(deploy.path().join("a.example/meetings.db")).unwrap(),
            b"sqlite bytes"
        );
    }

    #[test]
    fn test_deploy_missing_database() {
        let deploy = tempdir().unwrap();
        let deployer = DirectoryDeployer::new(deploy.path());
        let err = deployer
            .deploy("a.example", Path::new("/nonexistent/meetings.db"))
            .unwrap_err();
        assert!(matches!(err, CapabilityError::Site(_)));
        assert!(!deployer.is_deployed("a.example"));
    }
}
