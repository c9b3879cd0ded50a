use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use blockdl_core::rate::{format_bytes, format_duration, SpeedSampler};
use blockdl_core::{
    CoreError, EngineConfig, MissionContext, MissionId, MissionKey, MissionRegistry,
    MissionRequest, MissionStatus, RegistryHandle,
};
use log::{debug, LevelFilter};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

fn main() {
    init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let handle = RegistryHandle::new();
    if let Err(err) = build_registry(&handle) {
        eprintln!("error: {}", err);
        return;
    }
    let registry = match handle.get() {
        Ok(registry) => registry,
        Err(err) => {
            eprintln!("error: {}", err);
            return;
        }
    };

    match args[1].as_str() {
        "get" => {
            let request = match parse_get(&args[2..]) {
                Some(request) => request,
                None => {
                    print_usage();
                    return;
                }
            };
            match registry.create(request) {
                Ok(id) => {
                    println!("added mission: {}", id);
                    wait_with_progress(&registry);
                    report(&registry, id);
                }
                Err(err) => eprintln!("error: {}", err),
            }
        }
        "list" => match registry.records() {
            Ok(records) => {
                for (index, record) in records.iter().enumerate() {
                    let name = if record.name.is_empty() {
                        "?"
                    } else {
                        record.name.as_str()
                    };
                    println!(
                        "{}\t{}\t{}\t{:.1}%\t{}\t{}",
                        index,
                        record.id,
                        record.status(),
                        record.progress_percent(),
                        name,
                        record.origin_url
                    );
                }
            }
            Err(err) => eprintln!("error: {}", err),
        },
        "count" => println!("{}", registry.count()),
        "resume" => with_key(&args, |key| {
            let mission = registry.get(key)?;
            if registry.start(key)? {
                wait_with_progress(&registry);
                report(&registry, mission.id());
            } else {
                println!("mission {} is {}", key, mission.status());
            }
            Ok(())
        }),
        "resume-all" => match registry.resume_all() {
            Ok(started) => {
                println!("resumed {} missions", started);
                wait_with_progress(&registry);
            }
            Err(err) => eprintln!("error: {}", err),
        },
        "delete" => with_key(&args, |key| registry.delete(key)),
        "clear" => with_key(&args, |key| registry.clear(key)),
        _ => print_usage(),
    }
}

fn init_logging() {
    let level = env::var("BLOCKDL_LOG")
        .ok()
        .and_then(|value| value.trim().parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Warn);
    let config = ConfigBuilder::new()
        .set_target_level(LevelFilter::Error)
        .build();
    let _ = TermLogger::init(level, config, TerminalMode::Stderr, ColorChoice::Auto);
}

fn build_registry(handle: &RegistryHandle) -> Result<(), CoreError> {
    let config = EngineConfig::from_env();
    debug!(
        "downloads in {}, snapshots in {}",
        config.download_dir.display(),
        config.task_dir.display()
    );
    handle.register(MissionContext::new(config)?)?;
    Ok(())
}

fn parse_get(args: &[String]) -> Option<MissionRequest> {
    let mut iter = args.iter();
    let mut request = MissionRequest::new(iter.next()?.clone());
    while let Some(flag) = iter.next() {
        let value = iter.next()?;
        request = match flag.as_str() {
            "--name" => request.with_name(value.clone()),
            "--workers" => request.with_workers(value.parse().ok()?),
            "--cookie" => request.with_cookie(value.clone()),
            "--user-agent" => request.with_user_agent(value.clone()),
            "--dir" => request.with_location(value.clone()),
            _ => return None,
        };
    }
    Some(request)
}

fn with_key<F>(args: &[String], f: F)
where
    F: FnOnce(MissionKey) -> Result<(), CoreError>,
{
    let key = match args.get(2) {
        Some(value) => value,
        None => {
            print_usage();
            return;
        }
    };
    let key = match key.parse::<MissionKey>() {
        Ok(key) => key,
        Err(err) => {
            eprintln!("error: {}", err);
            return;
        }
    };
    if let Err(err) = f(key) {
        eprintln!("error: {}", err);
    }
}

fn report(registry: &MissionRegistry, id: MissionId) {
    let mission = match registry.get(id) {
        Ok(mission) => mission,
        // Dropped as a duplicate of an existing mission.
        Err(_) => {
            println!("mission {} duplicated an existing one", id);
            return;
        }
    };
    match mission.status() {
        MissionStatus::Finished => println!("saved {}", mission.destination().display()),
        MissionStatus::Errored => match mission.error() {
            Some(code) => eprintln!("failed: {} ({})", code, code.code()),
            None => eprintln!("failed"),
        },
        status => println!("mission {} is {}", id, status),
    }
}

fn print_usage() {
    eprintln!(
        "Usage: blockdl <command> [args]\n\
Commands:\n\
  get <url> [--name N] [--workers N] [--cookie C] [--user-agent UA] [--dir D]\n\
                          Download a file and wait for it\n\
  list                    List missions\n\
  count                   Number of missions\n\
  resume <id|index>       Resume a mission and wait\n\
  resume-all              Resume every unfinished mission\n\
  delete <id|index>       Remove a mission and its file\n\
  clear <id|index>        Remove a mission, keep its file\n\
Environment:\n\
  BLOCKDL_DOWNLOAD_DIR    Default download directory\n\
  BLOCKDL_TASK_DIR        Mission snapshot directory\n\
  BLOCKDL_BLOCK_SIZE      Block size in bytes\n\
  BLOCKDL_WORKERS         Default worker count\n\
  BLOCKDL_RETRIES         Retries per failed block\n\
  BLOCKDL_LOG             error|warn|info|debug|trace"
    );
}

fn wait_with_progress(registry: &Arc<MissionRegistry>) {
    let stop = Arc::new(AtomicBool::new(false));
    let printer = {
        let registry = Arc::clone(registry);
        let stop = Arc::clone(&stop);
        thread::spawn(move || print_progress(&registry, &stop))
    };
    registry.wait_idle();
    stop.store(true, Ordering::SeqCst);
    let _ = printer.join();
}

fn print_progress(registry: &MissionRegistry, stop: &AtomicBool) {
    let mut samplers: HashMap<MissionId, SpeedSampler> = HashMap::new();
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        for mission in registry.list().unwrap_or_default() {
            if !mission.is_running() {
                continue;
            }
            let record = mission.record();
            let sampler = samplers.entry(record.id).or_default();
            let speed = sampler.sample(now, record.done).unwrap_or(0);
            let eta = sampler
                .eta_secs(record.done, record.length)
                .map(format_duration)
                .unwrap_or_else(|| "--:--".to_string());
            println!(
                "[{}] {} {:.1}% {}/{} ({}/s) eta {} {}",
                record.status(),
                &record.id.to_string()[..8],
                record.progress_percent(),
                format_bytes(record.done),
                format_bytes(record.length),
                format_bytes(speed),
                eta,
                record.name
            );
        }
        sleep_unless_stopped(stop, Duration::from_secs(1));
    }
}

fn sleep_unless_stopped(stop: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::SeqCst) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
}
