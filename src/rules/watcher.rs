use super::RuleStore;
use notify::{Event, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::{Arc, PoisonError};
use tracing::{debug, warn};

impl RuleStore {
    /// Watch the rule file for changes. An observed write/create/rename only
    /// clears the mtime sentinel; the next `match_url` performs the actual
    /// reparse under the writer lock.
    ///
    /// The parent directory is watched rather than the file itself so a
    /// `rules.txt` created after startup is still picked up.
    pub fn watch(self: &Arc<Self>) -> Result<(), notify::Error> {
        let file_name = self.dsl_path.file_name().map(|n| n.to_os_string());
        let store = Arc::downgrade(self);

        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if !(event.kind.is_modify() || event.kind.is_create()) {
                        return;
                    }
                    let ours = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == file_name.as_deref());
                    if !ours {
                        return;
                    }
                    if let Some(store) = store.upgrade() {
                        debug!("rule file changed, scheduling reload");
                        store.force_reload();
                    }
                }
                Err(e) => warn!("rule file watch error: {}", e),
            })?;

        let dir = self
            .dsl_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        *self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(watcher);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::RuleStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_watcher_triggers_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let dsl = dir.path().join("rules.txt");
        std::fs::write(&dsl, "a.test/x status://404\n").unwrap();
        let store = RuleStore::new(&dsl, dir.path().join("rules.json")).unwrap();
        store.watch().unwrap();

        std::fs::write(&dsl, "a.test/x status://503\n").unwrap();

        // the watcher clears the sentinel asynchronously
        for _ in 0..100 {
            if store
                .match_url("a.test", "/x")
                .is_some_and(|r| r.param == "503")
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("rule change was not observed");
    }
}
