#![cfg(not(target_arch = "wasm32"))]

use std::panic;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use log::{debug, error, info, warn, LevelFilter};

use slop_resources::{
    AsyncResourceLoader, GpuBackend, HeadlessBackend, LoaderConfig, Priority, ResourceConfig,
    ResourceKind, ResourceManager, WgpuBackend,
};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const CONFIG_ENV: &str = "SLOP_LOADER_CONFIG";

fn main() -> anyhow::Result<()> {
    setup_diagnostics();

    let paths: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        eprintln!("usage: slop_resources <texture.png|model.glb>...");
        return Ok(());
    }

    let loader_config = match std::env::var(CONFIG_ENV) {
        Ok(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {CONFIG_ENV}={path}"))?;
            LoaderConfig::from_json_str(&text)?
        }
        Err(_) => LoaderConfig::default(),
    };

    match pollster::block_on(request_backend()) {
        Ok(backend) => run(backend, loader_config, &paths),
        Err(err) => {
            warn!("No GPU available ({err:#}); using the headless backend");
            run(HeadlessBackend::new(), loader_config, &paths)
        }
    }
}

/// Sets up logging and a panic hook that names the panicking thread
fn setup_diagnostics() {
    env_logger::Builder::new()
        .filter_level(if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
        .format_timestamp_millis()
        .format_target(false)
        .parse_default_env()
        .init();

    // Decoder panics are caught on the workers; this only records where they came from.
    panic::set_hook(Box::new(|panic_info| {
        let msg = match panic_info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<dyn Any>",
            },
        };
        let location = panic_info
            .location()
            .map_or("unknown location".to_string(), |loc| {
                format!("{}:{}", loc.file(), loc.line())
            });
        let current = thread::current();
        let thread_name = current.name().unwrap_or("<unnamed>");
        error!("panic on thread '{thread_name}' at {location}: {msg}");
    }));
}

async fn request_backend() -> anyhow::Result<WgpuBackend> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        })
        .await
        .context("no compatible adapter")?;

    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: Some("slop-resources"),
                ..Default::default()
            },
            None,
        )
        .await
        .context("device request failed")?;

    info!("Using adapter: {}", adapter.get_info().name);
    Ok(WgpuBackend::new(Arc::new(device), Arc::new(queue)))
}

fn run<B: GpuBackend>(backend: B, loader_config: LoaderConfig, paths: &[PathBuf]) -> anyhow::Result<()> {
    let mut manager = ResourceManager::new(backend, ResourceConfig::default());
    let loader = AsyncResourceLoader::<B>::new(loader_config, Arc::clone(manager.decoder()))?;
    loader.set_progress_callback(|path, progress| {
        debug!("{}: {:.0}%", path.display(), progress * 100.0);
    });

    let texture_desc = manager.config().texture_defaults;
    let model_desc = manager.config().model_defaults;
    let failures = Arc::new(AtomicUsize::new(0));

    for path in paths {
        let shown = path.display().to_string();
        let failures = Arc::clone(&failures);
        match ResourceKind::from_path(path) {
            Some(ResourceKind::Texture) => {
                loader.load_texture_async(path, &texture_desc, Priority::NORMAL, move |result| {
                    match result {
                        Ok(handle) => info!("{shown} -> {handle:?}"),
                        Err(err) => {
                            error!("{err}");
                            failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })?
            }
            Some(ResourceKind::Model) => {
                loader.load_model_async(path, &model_desc, Priority::NORMAL, move |result| {
                    match result {
                        Ok(handle) => info!("{shown} -> {handle:?}"),
                        Err(err) => {
                            error!("{err}");
                            failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })?
            }
            _ => warn!("Skipping {shown}: unknown file type"),
        }
    }

    // Stand-in for a frame loop: drain a bounded batch per "frame".
    let started = Instant::now();
    let mut frames = 0u32;
    while loader.pending_count() > 0 {
        if loader.process_frame(&mut manager) == 0 {
            thread::sleep(Duration::from_millis(16));
        }
        frames += 1;
    }
    loader.shutdown(&mut manager);
    info!(
        "Loaded {} file(s) in {:.2?} over {frames} frames",
        paths.len(),
        started.elapsed()
    );

    println!("{}", manager.stats());
    manager.shutdown();

    let failures = failures.load(Ordering::Relaxed);
    if failures > 0 {
        bail!("{failures} load(s) failed");
    }
    Ok(())
}
