use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::block::block_at;
use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::mission::{Mission, MissionRecord, RunControl};
use crate::net::{DownloadRequest, NetClient};

const STOP_POLL: Duration = Duration::from_millis(50);

/// Immutable view of a mission taken when `start()` dispatches workers.
#[derive(Debug, Clone)]
pub(crate) struct RunPlan {
    pub url: String,
    pub cookie: String,
    pub user_agent: String,
    pub destination: PathBuf,
    pub length: u64,
    pub block_size: u64,
    pub block_count: u64,
    pub worker_count: u32,
    pub fallback: bool,
}

impl RunPlan {
    pub fn from_record(record: &MissionRecord) -> Self {
        let url = if record.redirect_url.is_empty() {
            record.url.clone()
        } else {
            record.redirect_url.clone()
        };
        Self {
            url,
            cookie: record.cookie.clone(),
            user_agent: record.user_agent.clone(),
            destination: record.destination(),
            length: record.length,
            block_size: record.block_size,
            block_count: record.block_count,
            worker_count: record.worker_count.max(1),
            fallback: record.fallback,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    attempts: u32,
    backoff: Duration,
}

pub(crate) fn spawn_workers(
    mission: &Arc<Mission>,
    run: &Arc<RunControl>,
    plan: RunPlan,
) -> CoreResult<Vec<JoinHandle<()>>> {
    let config = &mission.context().config;
    let retry = RetryPolicy {
        attempts: config.block_retry_count,
        backoff: config.retry_backoff(),
    };
    let buffer_size = config.buffer_size.max(1);
    let plan = Arc::new(plan);
    let workers = if plan.fallback { 1 } else { plan.worker_count };

    let mut handles = Vec::with_capacity(workers as usize);
    for worker in 0..workers {
        let owner = Arc::clone(mission);
        let token = Arc::clone(run);
        let plan = Arc::clone(&plan);
        let net = Arc::clone(&mission.context().net);
        let handle = thread::Builder::new()
            .name(format!("mission-{}-w{}", mission.id(), worker))
            .spawn(move || {
                token.wait_released();
                if plan.fallback {
                    stream_worker(&owner, &token, &plan, net.as_ref(), retry, buffer_size);
                } else {
                    block_worker(&owner, &token, &plan, worker, net.as_ref(), retry, buffer_size);
                }
            })
            .map_err(|err| CoreError::Io(err.to_string()));
        match handle {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                // Workers already spawned see a released, stopped run and exit.
                run.abort();
                for handle in handles {
                    let _ = handle.join();
                }
                return Err(err);
            }
        }
    }
    Ok(handles)
}

fn block_worker(
    mission: &Arc<Mission>,
    run: &RunControl,
    plan: &RunPlan,
    worker: u32,
    net: &dyn NetClient,
    retry: RetryPolicy,
    buffer_size: usize,
) {
    let mut buffer = vec![0u8; buffer_size];
    let stride = plan.worker_count as u64;
    loop {
        if run.is_stopped() {
            return;
        }
        let Some(cursor) = mission.cursor(worker) else {
            return;
        };
        let Some(block) = block_at(cursor, plan.block_size, plan.length)
            .filter(|_| cursor < plan.block_count)
        else {
            debug!("mission {} worker {} done", mission.id(), worker);
            mission.report_worker_finished_for(Some(run));
            return;
        };
        if mission.is_block_completed(cursor) {
            if !mission.skip_block_for(run, worker, cursor + stride) {
                return;
            }
            continue;
        }

        let mut attempt = 0u32;
        let written = loop {
            let mut req = DownloadRequest::new(plan.url.clone(), plan.user_agent.clone());
            req.cookie = plan.cookie.clone();
            req.range = Some((block.range_start, Some(block.range_end)));

            let result = net.get_stream(&req).and_then(|resp| {
                if resp.status_code != 206 {
                    return Err(CoreError::Network(format!(
                        "block {} answered with status {}",
                        block.index, resp.status_code
                    )));
                }
                stream_to_file(
                    resp.body,
                    &plan.destination,
                    block.range_start,
                    Some(block.size()),
                    run,
                    &mut buffer,
                    |_| true,
                )
            });
            match result {
                Ok(written) => break Ok(written),
                Err(err) if attempt < retry.attempts && !run.is_stopped() => {
                    attempt += 1;
                    warn!(
                        "mission {} block {} failed ({}), retry {}/{}",
                        mission.id(),
                        block.index,
                        err,
                        attempt,
                        retry.attempts
                    );
                    mission.report_waiting_for(run);
                    if !sleep_unless_stopped(run, retry.backoff) {
                        return;
                    }
                }
                Err(err) => break Err(err),
            }
        };

        match written {
            Ok(Some(bytes)) => {
                if !mission.report_block_completed_for(run, worker, block.index, bytes) {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                if run.is_stopped() {
                    return;
                }
                warn!(
                    "mission {} block {} gave up: {}",
                    mission.id(),
                    block.index,
                    err
                );
                mission.report_error_for(Some(run), ErrorCode::Unknown);
                return;
            }
        }
    }
}

fn stream_worker(
    mission: &Arc<Mission>,
    run: &RunControl,
    plan: &RunPlan,
    net: &dyn NetClient,
    retry: RetryPolicy,
    buffer_size: usize,
) {
    let mut buffer = vec![0u8; buffer_size];
    let mut attempt = 0u32;
    let mut received = 0u64;
    loop {
        if run.is_stopped() {
            return;
        }
        let mut req = DownloadRequest::new(plan.url.clone(), plan.user_agent.clone());
        req.cookie = plan.cookie.clone();

        let result = net.get_stream(&req).and_then(|resp| {
            if !(200..300).contains(&resp.status_code) {
                return Err(CoreError::Network(format!(
                    "stream answered with status {}",
                    resp.status_code
                )));
            }
            stream_to_file(
                resp.body,
                &plan.destination,
                0,
                Some(plan.length),
                run,
                &mut buffer,
                |read| {
                    received += read;
                    mission.report_progress_for(run, read)
                },
            )
        });

        match result {
            Ok(Some(_)) => {
                mission.report_worker_finished_for(Some(run));
                return;
            }
            Ok(None) => return,
            // Only a stream that never produced a byte can be retried.
            Err(err) if received == 0 && attempt < retry.attempts && !run.is_stopped() => {
                attempt += 1;
                warn!(
                    "mission {} stream failed ({}), retry {}/{}",
                    mission.id(),
                    err,
                    attempt,
                    retry.attempts
                );
                mission.report_waiting_for(run);
                if !sleep_unless_stopped(run, retry.backoff) {
                    return;
                }
            }
            Err(err) => {
                if !run.is_stopped() {
                    warn!("mission {} stream gave up: {}", mission.id(), err);
                    mission.report_error_for(Some(run), ErrorCode::Unknown);
                }
                return;
            }
        }
    }
}

/// Copy `body` into `path` starting at `offset`, never past `limit` bytes.
///
/// Returns `Ok(None)` when the run was stopped or `on_chunk` asked to stop,
/// and an error when the body ends before `limit` bytes arrived.
fn stream_to_file(
    mut body: Box<dyn Read + Send>,
    path: &Path,
    offset: u64,
    limit: Option<u64>,
    run: &RunControl,
    buffer: &mut [u8],
    mut on_chunk: impl FnMut(u64) -> bool,
) -> CoreResult<Option<u64>> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|err| CoreError::Io(err.to_string()))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|err| CoreError::Io(err.to_string()))?;

    let mut written = 0u64;
    loop {
        if run.is_stopped() {
            return Ok(None);
        }
        let want = match limit {
            Some(limit) => {
                let left = limit.saturating_sub(written);
                if left == 0 {
                    break;
                }
                left.min(buffer.len() as u64) as usize
            }
            None => buffer.len(),
        };
        let read = body
            .read(&mut buffer[..want])
            .map_err(|err| CoreError::Network(err.to_string()))?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])
            .map_err(|err| CoreError::Io(err.to_string()))?;
        written += read as u64;
        if !on_chunk(read as u64) {
            return Ok(None);
        }
    }
    file.flush().map_err(|err| CoreError::Io(err.to_string()))?;

    if let Some(limit) = limit {
        if written < limit {
            return Err(CoreError::Network(format!(
                "body ended after {} of {} bytes",
                written, limit
            )));
        }
    }
    Ok(Some(written))
}

fn sleep_unless_stopped(run: &RunControl, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if run.is_stopped() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(STOP_POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn released_run() -> RunControl {
        let run = RunControl::new();
        run.release();
        run
    }

    #[test]
    fn stream_to_file_writes_at_offset_and_respects_limit() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("target.bin");
        fs::write(&path, vec![0u8; 10]).unwrap();

        let run = released_run();
        let mut buffer = vec![0u8; 3];
        let body: Box<dyn Read + Send> = Box::new(Cursor::new(b"abcdefgh".to_vec()));
        let written =
            stream_to_file(body, &path, 4, Some(4), &run, &mut buffer, |_| true).unwrap();

        assert_eq!(written, Some(4));
        assert_eq!(fs::read(&path).unwrap(), b"\0\0\0\0abcd\0\0".to_vec());
    }

    #[test]
    fn short_body_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("short.bin");
        fs::write(&path, vec![0u8; 8]).unwrap();

        let run = released_run();
        let mut buffer = vec![0u8; 16];
        let body: Box<dyn Read + Send> = Box::new(Cursor::new(b"abc".to_vec()));
        let result = stream_to_file(body, &path, 0, Some(8), &run, &mut buffer, |_| true);
        assert!(matches!(result, Err(CoreError::Network(_))));
    }

    #[test]
    fn stopped_run_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("stopped.bin");
        fs::write(&path, vec![0u8; 4]).unwrap();

        let run = released_run();
        run.abort();
        let mut buffer = vec![0u8; 4];
        let body: Box<dyn Read + Send> = Box::new(Cursor::new(b"data".to_vec()));
        let result = stream_to_file(body, &path, 0, Some(4), &run, &mut buffer, |_| true);
        assert_eq!(result.unwrap(), None);
        assert_eq!(fs::read(&path).unwrap(), vec![0u8; 4]);
    }
}
