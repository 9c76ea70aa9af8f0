use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use scheduler_domain::TemplateStore;
use scheduler_errors::{SchedulerError, SchedulerResult};

/// 从目录读取 `{name}.{extension}` 模板文件
#[derive(Debug, Clone)]
pub struct FileTemplateStore {
    directory: PathBuf,
    extension: String,
}

impl FileTemplateStore {
    pub fn new(directory: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            extension: extension.into(),
        }
    }

    fn path_for(&self, name: &str) -> SchedulerResult<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(SchedulerError::misconfigured(format!("非法的模板名: {name}")));
        }
        Ok(self.directory.join(format!("{}.{}", name, self.extension)))
    }
}

#[async_trait]
impl TemplateStore for FileTemplateStore {
    async fn load(&self, name: &str) -> SchedulerResult<Option<String>> {
        let path = self.path_for(name)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                debug!("加载模板 {}", path.display());
                Ok(Some(content))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryTemplateStore {
    templates: Arc<RwLock<HashMap<String, String>>>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, name: impl Into<String>, template: impl Into<String>) {
        self.templates
            .write()
            .await
            .insert(name.into(), template.into());
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn load(&self, name: &str) -> SchedulerResult<Option<String>> {
        Ok(self.templates.read().await.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_template_store() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("quest.q"), "#PBS -A {key}\n")
            .await
            .unwrap();

        let store = FileTemplateStore::new(dir.path(), "q");
        assert_eq!(
            store.load("quest").await.unwrap().as_deref(),
            Some("#PBS -A {key}\n")
        );
        assert!(store.load("edison").await.unwrap().is_none());
        assert!(store.load("../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_in_memory_template_store() {
        let store = InMemoryTemplateStore::new();
        store.insert("quest", "{binary}").await;
        assert_eq!(store.load("quest").await.unwrap().as_deref(), Some("{binary}"));
        assert!(store.load("other").await.unwrap().is_none());
    }
}
