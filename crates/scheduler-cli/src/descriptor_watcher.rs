//! Descriptor hot-reload watcher, adapted from the teacher's
//! `agentor-cli::config_watcher::ConfigWatcher`: watch a file for
//! modifications and invoke a callback after a debounce window. Here the
//! callback re-installs the descriptor's jobs and triggers into a live
//! [`scheduler_core::Scheduler`] instead of swapping in a parsed config
//! struct.

use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

/// Watches a descriptor file on disk and calls back on every (debounced)
/// change. Dropping this stops the background thread and releases the
/// file-system watch.
pub struct DescriptorWatcher {
    _watcher: RecommendedWatcher,
}

impl DescriptorWatcher {
    /// Start watching `descriptor_path` for modifications.
    ///
    /// `on_reload` is called on a background thread each time the file is
    /// modified, with the freshly read file contents. Read errors are
    /// logged via `tracing::warn` and do not invoke the callback — the
    /// previously installed schedule keeps running undisturbed.
    pub fn start<F>(
        descriptor_path: PathBuf,
        debounce_ms: u64,
        on_reload: F,
    ) -> anyhow::Result<Self>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let (tx, rx) = std_mpsc::channel();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Modify(_)) {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| anyhow::anyhow!("failed to create descriptor watcher: {e}"))?;

        watcher
            .watch(descriptor_path.as_ref(), RecursiveMode::NonRecursive)
            .map_err(|e| anyhow::anyhow!("failed to watch descriptor file: {e}"))?;

        let path = descriptor_path.clone();
        std::thread::spawn(move || {
            let mut last_reload = std::time::Instant::now();
            let debounce = std::time::Duration::from_millis(debounce_ms);

            while rx.recv().is_ok() {
                while rx.try_recv().is_ok() {}

                let now = std::time::Instant::now();
                if now.duration_since(last_reload) < debounce {
                    std::thread::sleep(debounce - now.duration_since(last_reload));
                }
                last_reload = std::time::Instant::now();

                match std::fs::read_to_string(&path) {
                    Ok(contents) => on_reload(contents),
                    Err(e) => tracing::warn!(error = %e, path = %path.display(), "failed to reread descriptor"),
                }
            }
            tracing::debug!("descriptor watcher thread exiting");
        });

        tracing::info!(path = %descriptor_path.display(), "descriptor hot-reload watcher started");
        Ok(Self { _watcher: watcher })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_watcher_invokes_callback_on_modification() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "jobs: []").unwrap();
        let path = tmp.path().to_path_buf();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_cb = calls.clone();
        let _watcher = DescriptorWatcher::start(path.clone(), 50, move |_contents| {
            calls_for_cb.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        writeln!(file, "triggers: []").unwrap();
        file.sync_all().unwrap();

        std::thread::sleep(Duration::from_millis(400));
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }
}
