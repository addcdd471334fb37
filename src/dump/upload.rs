//! Batched upload pump. The dumper hands finished CSV paths over a
//! bounded queue; a single worker groups them by calendar date into
//! batches of at most eight files and ships each batch with one
//! `gsutil` copy, skip-existing, with a per-batch manifest log. A
//! `None` on the queue tells the worker to drain and exit.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;
use tracing::{error, info};

use crate::error::Result;

const BATCH_LIMIT: usize = 8;
const UPLOAD_TRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Replaces the original's yield/send coroutine: batches come off the
/// head, unfinished paths go back to the head, and a path is re-queued
/// at most once before it is given up on.
pub struct UploadBatcher {
    queue: VecDeque<PathBuf>,
    requeued: HashSet<PathBuf>,
}

impl UploadBatcher {
    pub fn new() -> UploadBatcher {
        UploadBatcher {
            queue: VecDeque::new(),
            requeued: HashSet::new(),
        }
    }

    pub fn push(&mut self, path: PathBuf) {
        self.queue.push_back(path);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Up to eight files from the head, all under the same date
    /// directory.
    pub fn next_batch(&mut self) -> Vec<PathBuf> {
        let mut batch: Vec<PathBuf> = Vec::new();
        while batch.len() < BATCH_LIMIT {
            let same_date = match (self.queue.front(), batch.first()) {
                (Some(next), Some(first)) => date_of(next) == date_of(first),
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !same_date {
                break;
            }
            if let Some(next) = self.queue.pop_front() {
                batch.push(next);
            }
        }
        batch
    }

    /// Unfinished paths go back to the head for one more attempt;
    /// repeat offenders are dropped with an error, the files stay on
    /// disk.
    pub fn report_unfinished(&mut self, unfinished: Vec<PathBuf>) {
        for path in unfinished.into_iter().rev() {
            if self.requeued.insert(path.clone()) {
                self.queue.push_front(path);
            } else {
                error!(
                    "upload of {} failed twice, leaving the file on disk",
                    path.display()
                );
            }
        }
    }
}

impl Default for UploadBatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn date_of(path: &Path) -> Option<&std::ffi::OsStr> {
    path.parent().and_then(Path::file_name)
}

/// The background worker. Exits once the sentinel arrived and the
/// queue is drained.
pub fn upload_worker(rx: Receiver<Option<PathBuf>>, gs_url: String) {
    let mut batcher = UploadBatcher::new();
    let mut done = false;
    while !done {
        match rx.recv() {
            Ok(Some(path)) => batcher.push(path),
            Ok(None) | Err(_) => done = true,
        }
        // opportunistically drain whatever else is queued
        while let Ok(message) = rx.try_recv() {
            match message {
                Some(path) => batcher.push(path),
                None => done = true,
            }
        }
        while !batcher.is_empty() {
            let batch = batcher.next_batch();
            upload_batch(&mut batcher, batch, &gs_url);
        }
    }
    info!("all csv_files upload ok, thread exit!");
}

/// One `gsutil -m cp -n -L <manifest> <files> <dst>/<date>/` run with
/// retries; on exhaustion the manifest decides what is still pending.
fn upload_batch(batcher: &mut UploadBatcher, batch: Vec<PathBuf>, gs_url: &str) {
    let parent = match batch.first().and_then(|p| p.parent()) {
        Some(parent) => parent.to_path_buf(),
        None => return,
    };
    let date = parent
        .file_name()
        .map(|d| d.to_string_lossy().into_owned())
        .unwrap_or_default();
    let manifest = parent.join("upload.info");
    let sources: Vec<String> = batch
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    info!("start uploading {:?} to gstorage", sources);

    let cmd = format!(
        "gsutil -m cp -n -L {} {} {}/{}/",
        manifest.display(),
        sources.join(" "),
        gs_url,
        date
    );
    let (code, output) = run_cmd_retry(&cmd, UPLOAD_TRIES);
    if code == 0 {
        info!("upload successfully, files count:{}", batch.len());
        return;
    }
    error!("{} run error. ret:{}, out:{}", cmd, code, output);
    match parse_unfinished(&manifest, &batch) {
        Ok(unfinished) => batcher.report_unfinished(unfinished),
        Err(err) => error!(
            "cannot read manifest {}: {}; leaving batch on disk",
            manifest.display(),
            err
        ),
    }
}

/// Parses the copy manifest (`Source,Destination,...`) and returns the
/// batch paths it does not confirm.
pub fn parse_unfinished(manifest: &Path, batch: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut reader = csv::Reader::from_path(manifest)?;
    let headers = reader.headers()?.clone();
    let source_idx = headers
        .iter()
        .position(|h| h.trim() == "Source")
        .unwrap_or(0);
    let mut confirmed: HashSet<String> = HashSet::new();
    for record in reader.records() {
        let record = record?;
        if let Some(source) = record.get(source_idx) {
            confirmed.insert(source.trim_start_matches("file://").to_string());
        }
    }
    Ok(batch
        .iter()
        .filter(|path| !confirmed.contains(path.to_string_lossy().as_ref()))
        .cloned()
        .collect())
}

fn run_cmd_retry(cmd: &str, tries: u32) -> (i32, String) {
    let mut last = (-1, String::new());
    for attempt in 0..tries {
        match Command::new("sh").arg("-c").arg(cmd).output() {
            Ok(output) => {
                let code = output.status.code().unwrap_or(-1);
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                if code == 0 {
                    return (0, text);
                }
                last = (code, text);
            }
            Err(err) => last = (-1, err.to_string()),
        }
        if attempt + 1 < tries {
            thread::sleep(RETRY_BACKOFF);
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn dated(date: &str, name: &str) -> PathBuf {
        PathBuf::from(format!("/dumps/{}/{}", date, name))
    }

    #[test]
    fn batches_cap_at_eight_files() {
        let mut batcher = UploadBatcher::new();
        for i in 0..10 {
            batcher.push(dated("20260801", &format!("db.t.{}.csv", i)));
        }
        assert_eq!(batcher.next_batch().len(), 8);
        assert_eq!(batcher.next_batch().len(), 2);
        assert!(batcher.is_empty());
    }

    #[test]
    fn batches_never_mix_dates() {
        let mut batcher = UploadBatcher::new();
        batcher.push(dated("20260731", "db.t.1.csv"));
        batcher.push(dated("20260731", "db.t.2.csv"));
        batcher.push(dated("20260801", "db.t.3.csv"));
        let first = batcher.next_batch();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|p| p.starts_with("/dumps/20260731")));
        assert_eq!(batcher.next_batch().len(), 1);
    }

    #[test]
    fn unfinished_paths_requeue_at_the_head_once() {
        let mut batcher = UploadBatcher::new();
        batcher.push(dated("20260801", "db.t.1.csv"));
        batcher.push(dated("20260801", "db.t.2.csv"));
        let batch = batcher.next_batch();
        batcher.report_unfinished(batch.clone());
        // same order, back at the head
        assert_eq!(batcher.next_batch(), batch);
        // a second failure drops them
        batcher.report_unfinished(batch);
        assert!(batcher.is_empty());
    }

    #[test]
    fn manifest_filters_confirmed_sources() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("upload.info");
        let mut file = std::fs::File::create(&manifest).unwrap();
        writeln!(
            file,
            "Source,Destination,Start,End,Md5,UploadId,Source Size,Bytes Transferred,Result,Description"
        )
        .unwrap();
        writeln!(
            file,
            "file:///dumps/20260801/db.t.1.csv,gs://bucket/1/20260801/db.t.1.csv,0,1,x,u,10,10,OK,"
        )
        .unwrap();

        let batch = vec![
            PathBuf::from("/dumps/20260801/db.t.1.csv"),
            PathBuf::from("/dumps/20260801/db.t.2.csv"),
        ];
        let unfinished = parse_unfinished(&manifest, &batch).unwrap();
        assert_eq!(unfinished, vec![PathBuf::from("/dumps/20260801/db.t.2.csv")]);
    }
}
