use rio_dsa::utils::{KB, MB};
use rio_dsa::{Batch, BatchConfig, SoftwareQueue, SoftwareQueueConfig, WorkQueue};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// Compares FIFO and out-of-order group recycling on a multi-engine software queue.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    println!("============================================================");
    println!("              rio-dsa - Batch Recycling Statistics          ");
    println!("============================================================");

    let sources: Vec<Vec<u8>> = (0..512usize)
        .map(|i| vec![i as u8; 16 * KB + (i % 7) * KB])
        .collect();
    let total: usize = sources.iter().map(Vec::len).sum();
    let mut dst = vec![0u8; total];

    for out_of_order in [false, true] {
        let sw = SoftwareQueueConfig::new()
            .with_engines(4)
            .with_latency(Duration::from_micros(20));
        let queue: Arc<dyn WorkQueue> = Arc::new(SoftwareQueue::new("soft-wq", sw)?);
        let config = BatchConfig::new()
            .with_capacity(8)
            .with_group_size(8)
            .out_of_order_recycle(out_of_order, 2);

        println!("[+] Recycling: {}", if out_of_order { "out of order" } else { "fifo" });
        let start = Instant::now();
        let mut batch = Batch::new(queue, config)?;
        let mut offset = 0;
        for src in &sources {
            unsafe { batch.submit_move(dst.as_mut_ptr().add(offset), src)? };
            offset += src.len();
        }
        batch.wait()?;
        let elapsed = start.elapsed();

        let stats = batch.stats();
        println!("    Descriptors:   {}", stats.submitted);
        println!("    Groups:        {}", stats.groups_submitted);
        println!("    Drains:        {}", stats.drains);
        println!("    Window:        {}", batch.recycle_window());
        println!(
            "    Throughput:    {:.1} MiB/s",
            total as f64 / MB as f64 / elapsed.as_secs_f64()
        );
        batch.print_stats();
    }

    println!("[+] Verifying destination...");
    let mut offset = 0;
    for src in &sources {
        if dst[offset..offset + src.len()] != src[..] {
            return Err(format!("mismatch at offset {offset}").into());
        }
        offset += src.len();
    }
    println!("    OK");

    Ok(())
}
