use std::time::Duration;

use anyhow::Context;
use page_streamer::memory::HostMemory;
use page_streamer::streaming::*;
use page_streamer::StreamingConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const STREAMING_PAGES_PER_RESOURCE: u32 = 48;
const PAYLOAD_BYTES: usize = 1024;
const CYCLES: u32 = 64;

fn main() -> anyhow::Result<()> {
    page_streamer::init_logging();

    println!("Page Streamer - Streaming Cycle Test");
    println!("====================================");

    let config = match std::env::args().nth(1) {
        Some(path) => StreamingConfig::load(&path).with_context(|| format!("Failed to load config from {}", path))?,
        None => demo_config(),
    };

    let memory = HostMemory::new();
    let mut manager = StreamingManager::new(config.clone(), Box::new(memory.clone()), make_dispatcher(&config)?)?;
    manager.set_diagnostics(|event| log::warn!("[streaming_test] {:?}", event));

    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut handles = Vec::new();

    println!("\n1. Registering resources");
    println!("------------------------");
    for index in 0..4 {
        let builder = demo_builder(&format!("resource-{}", index), &mut rng);
        let handle = manager.add(builder.build()?)?;
        println!("Added resource-{} as {:?}", index, handle);
        handles.push(handle);
    }

    let pack_path = std::env::temp_dir().join(format!("page_streamer_{}.pack", std::process::id()));
    let (descriptor, streamable) = demo_builder("packed", &mut rng).build_parts()?;
    write_pack(&pack_path, &descriptor, &streamable)?;
    let handle = manager.add(open_pack(&pack_path)?)?;
    println!("Added pack {} as {:?}", pack_path.display(), handle);
    handles.push(handle);

    println!("\n2. Running {} cycles of random feedback", CYCLES);
    println!("------------------------------------------");
    let feedback = manager.feedback_queue();
    for cycle in 0..CYCLES {
        for _ in 0..rng.gen_range(8..48) {
            let handle = handles[rng.gen_range(0..handles.len())];
            let first_page = rng.gen_range(1..=STREAMING_PAGES_PER_RESOURCE);
            let page_count = rng.gen_range(1..=4u32).min(STREAMING_PAGES_PER_RESOURCE + 1 - first_page);
            feedback.push(FeedbackRecord::new(handle, first_page, page_count, rng.gen_range(1..1000)));
        }

        manager.begin_update()?;
        manager.end_update()?;

        if cycle % 16 == 15 {
            let stats = manager.stats();
            println!(
                "cycle {:>3}: {} registered, {} in flight, {} installed, {} evictions",
                cycle + 1,
                stats.registered_pages,
                stats.pending_pages,
                stats.pages_installed,
                stats.evictions
            );
        }
    }

    // Let outstanding reads land
    for _ in 0..32 {
        if manager.num_pending() == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
        manager.begin_update()?;
        manager.end_update()?;
    }

    println!("\n3. Residency");
    println!("------------");
    for (handle, units) in manager.take_modified_resources() {
        let name = manager.resource(handle).map(|r| r.name().to_string()).unwrap_or_default();
        let resident = (0..=STREAMING_PAGES_PER_RESOURCE)
            .filter(|&page| manager.is_page_resident(handle, page))
            .count();
        println!("{:<12} {:>3} resident pages, {:>4} units", name, resident, units);
    }

    println!("\n4. Removing resources");
    println!("---------------------");
    for handle in handles {
        manager.remove(handle)?;
    }
    println!("{}", serde_json::to_string_pretty(&manager.capacity_counters())?);
    println!("{}", serde_json::to_string_pretty(&manager.stats())?);

    if let Err(e) = std::fs::remove_file(&pack_path) {
        log::warn!("[streaming_test] Failed to remove {}: {}", pack_path.display(), e);
    }
    println!("\nStreaming test finished");
    Ok(())
}

fn demo_config() -> StreamingConfig {
    StreamingConfig {
        max_streaming_pages: 64,
        max_pending_pages: 16,
        streaming_page_size: 4096,
        root_page_size: 2048,
        num_initial_root_pages: 16,
        max_root_pages: 256,
        root_allocation_granularity: 16,
        staging_buffer_size: 256 * 1024,
        bandwidth_limit_mb_per_sec: Some(64.0),
        read_timeout_ms: Some(2_000),
        ..StreamingConfig::default()
    }
}

/// One root page and a binary tree of streaming pages, each patching its own hierarchy child
fn demo_builder(name: &str, rng: &mut StdRng) -> ResourceBuilder {
    let num_nodes = (STREAMING_PAGES_PER_RESOURCE as usize).div_ceil(HIERARCHY_FANOUT);
    let mut builder = ResourceBuilder::new(name);
    builder.hierarchy_nodes(vec![HierarchyNode::empty(); num_nodes]);
    builder.with_checksums(true);
    builder.root_page(PageSpec::new(random_payload(rng)).with_units(1));

    for page in 1..=STREAMING_PAGES_PER_RESOURCE {
        let parents: Vec<u32> = if page > 1 { vec![page / 2] } else { Vec::new() };
        let slot = page - 1;
        let fixup = FixupSpec::new(page, slot / HIERARCHY_FANOUT as u32, slot % HIERARCHY_FANOUT as u32)
            .with_dependencies(&parents);
        builder.streaming_page(
            PageSpec::new(random_payload(rng))
                .with_units(rng.gen_range(1..8))
                .with_dependencies(&parents)
                .with_fixup(fixup),
        );
    }
    builder
}

fn random_payload(rng: &mut StdRng) -> Vec<u8> {
    (0..PAYLOAD_BYTES).map(|_| rng.gen()).collect()
}

#[cfg(feature = "native")]
fn make_dispatcher(config: &StreamingConfig) -> anyhow::Result<Box<dyn ReadDispatcher>> {
    Ok(Box::new(TokioDispatcher::new(config.io_worker_threads)?))
}

#[cfg(not(feature = "native"))]
fn make_dispatcher(_config: &StreamingConfig) -> anyhow::Result<Box<dyn ReadDispatcher>> {
    Ok(Box::new(InlineDispatcher))
}
