use async_trait::async_trait;
use dashmap::DashMap;

use super::{Directory, DirectoryError};

/// In-process directory backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    routes: DashMap<String, String>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered identities
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn set(&self, identity: &str, route: &str) -> Result<(), DirectoryError> {
        self.routes.insert(identity.to_string(), route.to_string());
        Ok(())
    }

    async fn get(&self, identity: &str) -> Result<Option<String>, DirectoryError> {
        Ok(self.routes.get(identity).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, identity: &str) -> Result<(), DirectoryError> {
        self.routes.remove(identity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_get_absent() {
        let directory = MemoryDirectory::new();
        assert_eq!(directory.get("D1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let directory = MemoryDirectory::new();

        directory.set("D1", "conn-1").await.unwrap();
        directory.set("D1", "conn-2").await.unwrap();

        assert_eq!(directory.get("D1").await.unwrap().as_deref(), Some("conn-2"));
        assert_eq!(directory.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_then_get() {
        let directory = MemoryDirectory::new();

        directory.set("D1", "conn-1").await.unwrap();
        directory.delete("D1").await.unwrap();

        assert_eq!(directory.get("D1").await.unwrap(), None);
        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn test_delete_absent_is_noop() {
        let directory = MemoryDirectory::new();
        directory.set("D2", "conn-2").await.unwrap();

        assert!(directory.delete("D1").await.is_ok());
        assert!(directory.delete("D1").await.is_ok());
        assert_eq!(directory.get("D2").await.unwrap().as_deref(), Some("conn-2"));
    }

    #[tokio::test]
    async fn test_sequence_returns_latest_live_value() {
        let directory = MemoryDirectory::new();
        let ops: [(&str, Option<&str>); 6] = [
            ("set", Some("a")),
            ("set", Some("b")),
            ("delete", None),
            ("set", Some("c")),
            ("delete", None),
            ("set", Some("d")),
        ];

        let mut expected: Option<&str> = None;
        for (op, value) in ops {
            match (op, value) {
                ("set", Some(route)) => {
                    directory.set("D1", route).await.unwrap();
                    expected = Some(route);
                }
                _ => {
                    directory.delete("D1").await.unwrap();
                    expected = None;
                }
            }
            assert_eq!(directory.get("D1").await.unwrap().as_deref(), expected);
        }
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_disturb_other_keys() {
        let directory = Arc::new(MemoryDirectory::new());
        let mut handles = Vec::new();

        for i in 0..16 {
            let directory = Arc::clone(&directory);
            handles.push(tokio::spawn(async move {
                let identity = format!("device-{i}");
                for n in 0..50 {
                    directory.set(&identity, &format!("conn-{n}")).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(directory.len(), 16);
        for i in 0..16 {
            let route = directory.get(&format!("device-{i}")).await.unwrap();
            assert_eq!(route.as_deref(), Some("conn-49"));
        }
    }
}
