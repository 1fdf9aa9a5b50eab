//! Container registry.

use crate::config::{TrackerConfig, check_path_segment};
use crate::container::{Container, ContainerSpec};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tether_core::{Error, Result};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Creates containers as directories under `root` and keeps track of them
/// by handle.
#[derive(Debug)]
pub struct Backend {
    root: PathBuf,
    config: TrackerConfig,
    containers: RwLock<HashMap<String, Arc<Container>>>,
}

impl Backend {
    pub fn new(root: impl Into<PathBuf>, config: TrackerConfig) -> Self {
        Self {
            root: root.into(),
            config,
            containers: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates a container with its own work directory. An empty handle is
    /// replaced by a random one; any other handle must be a plain file name.
    pub async fn create(&self, mut spec: ContainerSpec) -> Result<Arc<Container>> {
        if spec.handle.is_empty() {
            spec.handle = uuid::Uuid::new_v4().to_string();
        }
        check_path_segment(&spec.handle)?;

        let mut containers = self.containers.write().await;
        if containers.contains_key(&spec.handle) {
            return Err(Error::DuplicateContainer(spec.handle));
        }

        let work_dir = self.root.join(&spec.handle);
        tokio::fs::create_dir_all(&work_dir).await?;

        let handle = spec.handle.clone();
        let container = Arc::new(Container::new(spec, work_dir, &self.config));
        containers.insert(handle.clone(), container.clone());
        debug!(handle, "container created");
        Ok(container)
    }

    pub async fn lookup(&self, handle: &str) -> Result<Arc<Container>> {
        self.containers
            .read()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| Error::UnknownContainer(handle.to_string()))
    }

    /// Kills every process in the container and removes its work directory.
    /// The container stays registered if its processes cannot be killed.
    pub async fn destroy(&self, handle: &str) -> Result<()> {
        let container = self.lookup(handle).await?;
        container.stop(true).await?;

        self.containers.write().await.remove(handle);

        match tokio::fs::remove_dir_all(container.work_dir()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(handle, "container destroyed");
        Ok(())
    }

    /// Containers whose properties include every entry of `filter`.
    pub async fn containers(&self, filter: &HashMap<String, String>) -> Vec<Arc<Container>> {
        let all: Vec<_> = self.containers.read().await.values().cloned().collect();

        let mut matching = Vec::new();
        for container in all {
            if container.matches(filter).await {
                matching.push(container);
            }
        }
        matching
    }

    /// Gracefully stops the processes of every container. Containers stay
    /// registered. Fails with the first error any container reported.
    pub async fn stop(&self) -> Result<()> {
        let all: Vec<_> = self.containers.read().await.values().cloned().collect();

        let mut stopping = JoinSet::new();
        for container in all {
            stopping.spawn(async move { container.stop(false).await });
        }

        let mut first_error = None;
        while let Some(joined) = stopping.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => warn!(error = %e, "container stop task failed"),
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{ProcessIo, ProcessSpec};

    #[tokio::test]
    async fn create_lookup_destroy() {
        let root = tempfile::tempdir().unwrap();
        let backend = Backend::new(root.path(), TrackerConfig::default());

        let container = backend
            .create(ContainerSpec::new().handle("web"))
            .await
            .unwrap();
        assert!(container.work_dir().is_dir());
        assert_eq!(backend.lookup("web").await.unwrap().handle(), "web");

        backend.destroy("web").await.unwrap();
        assert!(!container.work_dir().exists());
        assert!(matches!(
            backend.lookup("web").await,
            Err(Error::UnknownContainer(_))
        ));
    }

    #[tokio::test]
    async fn handles_default_to_unique_ids() {
        let root = tempfile::tempdir().unwrap();
        let backend = Backend::new(root.path(), TrackerConfig::default());

        let a = backend.create(ContainerSpec::new()).await.unwrap();
        let b = backend.create(ContainerSpec::new()).await.unwrap();

        assert!(!a.handle().is_empty());
        assert_ne!(a.handle(), b.handle());
    }

    #[tokio::test]
    async fn duplicate_handles_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        let backend = Backend::new(root.path(), TrackerConfig::default());
        backend
            .create(ContainerSpec::new().handle("web"))
            .await
            .unwrap();

        let err = backend
            .create(ContainerSpec::new().handle("web"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateContainer(_)));
    }

    #[tokio::test]
    async fn handles_cannot_point_outside_the_root() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let victim = outside.path().join("victim");
        std::fs::create_dir(&victim).unwrap();
        let backend = Backend::new(root.path(), TrackerConfig::default());

        for handle in [victim.to_str().unwrap(), "../victim", "nested/dir", ".."] {
            let err = backend
                .create(ContainerSpec::new().handle(handle))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidHandle(_)), "{handle}");
        }

        assert!(backend.containers(&HashMap::new()).await.is_empty());
        assert!(victim.is_dir());
        assert!(!root.path().join("nested").exists());
    }

    #[tokio::test]
    async fn destroying_unknown_containers_fails() {
        let root = tempfile::tempdir().unwrap();
        let backend = Backend::new(root.path(), TrackerConfig::default());

        assert!(matches!(
            backend.destroy("missing").await,
            Err(Error::UnknownContainer(_))
        ));
    }

    #[tokio::test]
    async fn containers_filter_by_properties() {
        let root = tempfile::tempdir().unwrap();
        let backend = Backend::new(root.path(), TrackerConfig::default());
        backend
            .create(ContainerSpec::new().handle("a").property("team", "infra"))
            .await
            .unwrap();
        backend
            .create(ContainerSpec::new().handle("b").property("team", "web"))
            .await
            .unwrap();

        assert_eq!(backend.containers(&HashMap::new()).await.len(), 2);

        let filter = HashMap::from([("team".to_string(), "web".to_string())]);
        let matching = backend.containers(&filter).await;
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].handle(), "b");
    }

    #[tokio::test]
    async fn destroy_kills_running_processes() {
        let root = tempfile::tempdir().unwrap();
        let backend = Backend::new(root.path(), TrackerConfig::default());
        let container = backend
            .create(ContainerSpec::new().handle("job"))
            .await
            .unwrap();

        let process = container
            .run(ProcessSpec::new("sleep").arg("30"), ProcessIo::new())
            .await
            .unwrap();

        backend.destroy("job").await.unwrap();
        assert_eq!(process.wait().await.unwrap(), 128 + 9);
    }
}
