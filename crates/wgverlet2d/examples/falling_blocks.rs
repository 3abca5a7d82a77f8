//! Headless demo: a column of blocks and particles raining onto a floor.
//!
//! Runs a few seconds of simulated time and prints per-frame stats, then
//! shuts the physics thread down cleanly. `RUST_LOG=debug` surfaces the
//! allocator growth and compaction events.

use nalgebra::point;
use wgverlet2d::diagnostics::LogSink;
use wgverlet2d::objects::ObjectBatch;
use wgverlet2d::runner::Event;
use wgverlet2d::{shapes, GpuInstance, PhysicsRunner, SimConfig};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let gpu = futures::executor::block_on(GpuInstance::new())?;
    println!("adapter: {}", gpu.adapter().get_info().name);

    let config = SimConfig::default();
    let runner = PhysicsRunner::spawn(gpu, config, Box::new(LogSink));

    let mut batch = ObjectBatch::new();
    shapes::static_block(&mut batch, point![0.0, -60.0], 100.0, 0.6, 0.0, 0);
    for row in 0..12 {
        for col in 0..12 {
            let x = (col as f32 - 5.5) * 6.0;
            let y = 10.0 + row as f32 * 6.0;
            let model = 1 + row * 12 + col;
            if (row + col) % 3 == 0 {
                shapes::particle(&mut batch, point![x, y], 1.2, 0.8, 0.4, 0.1, model);
            } else {
                shapes::block(&mut batch, point![x, y], 2.4, 1.0, 0.4, 0.1, model);
            }
        }
    }
    runner.ingress(batch);

    let frames = 120;
    for frame in 0..frames {
        runner.frame(config.tick_rate);
        if frame % 24 == 0 {
            println!("frame {frame}/{frames}");
        }
    }

    let events = runner.events().clone();
    runner.shutdown()?;

    let mut departed = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            Event::Egress(output) => departed += output.batch.entities.len(),
            Event::Dropped(seconds) => println!("dropped {seconds:.3}s of simulated time"),
        }
    }
    println!("done: {departed} entities left the partition");
    Ok(())
}
