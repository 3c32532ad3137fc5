use rio_dsa::utils::{KB, MB};
use rio_dsa::{
    BatchConfig, CopySizeStats, PmemConfig, Portal, PortalMode, SoftwareQueue, SoftwareQueueConfig,
    Stream, WorkQueue,
};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

// Usage: pmem_write <output file> [work queue device]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let output = args.next().ok_or("usage: pmem_write <output file> [wq device]")?;

    println!("============================================================");
    println!("              rio-dsa - Persistent Memory Write             ");
    println!("============================================================");

    let queue: Arc<dyn WorkQueue> = match args.next() {
        Some(device) => {
            println!("[+] Opening work queue portal {device}...");
            Arc::new(Portal::open(&device, PortalMode::Dedicated)?)
        }
        None => {
            println!("[+] No work queue given, using the software engine");
            let config = SoftwareQueueConfig::new().with_engines(4);
            Arc::new(SoftwareQueue::new("soft-wq", config)?)
        }
    };

    // A dump-like mix: many small records, some medium values, a few large blobs.
    let small: Vec<Vec<u8>> = (0..2000u32).map(|i| format!("key:{i}").into_bytes()).collect();
    let medium: Vec<Vec<u8>> = (0..200u8).map(|i| vec![i; 8 * KB]).collect();
    let large: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 4 * MB]).collect();

    let copy_stats = Arc::new(CopySizeStats::new());
    let config = PmemConfig::new()
        .with_growth(64 * MB)
        .with_batch(BatchConfig::new().out_of_order_recycle(true, 25))
        .with_copy_stats(Arc::clone(&copy_stats));

    println!("[+] Writing to {output}...");
    let start = Instant::now();
    let mut stream = Stream::with_pmem(&output, config, Some(queue))?;
    stream.enable_crc64();

    for (i, key) in small.iter().enumerate() {
        stream.write_bulk_string(key)?;
        if let Some(value) = medium.get(i % 250) {
            stream.write_bulk_string(value)?;
        }
    }
    for blob in &large {
        stream.write_bulk_string(blob)?;
    }
    stream.flush()?;

    let written = stream.tell();
    let checksum = stream.checksum();
    stream.close()?;
    let elapsed = start.elapsed();

    println!("    Bytes written: {written}");
    println!("    CRC64:         {checksum:#018x}");
    println!(
        "    Throughput:    {:.1} MiB/s",
        written as f64 / MB as f64 / elapsed.as_secs_f64()
    );
    println!("[+] CPU copy sizes:");
    println!("{}", copy_stats.report());

    Ok(())
}
