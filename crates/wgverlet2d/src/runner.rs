//! Fixed-timestep physics thread.
//!
//! The device world is owned by a dedicated thread; the host talks to it
//! through channels. Wall-clock time comes in as [`Command::Frame`]
//! messages and is accumulated into fixed sub-ticks; new populations come
//! in as [`Command::Ingress`] batches and merge ahead of the next frame;
//! departures and dropped-time notices come back out as [`Event`]s.
//!
//! Shutdown is drain-then-release: pending ingress batches are still
//! merged, buffered egress output is delivered, and the device queue is
//! drained before any buffer drops.

use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::config::SimConfig;
use crate::diagnostics::{DiagnosticsSink, RunStats};
use crate::egress::EgressOutput;
use crate::error::SimError;
use crate::gpu::GpuInstance;
use crate::objects::ObjectBatch;
use crate::pipeline::PhysicsPipeline;

/// Messages into the physics thread.
pub enum Command {
    /// Advance the simulation by `dt` wall-clock seconds.
    Frame(f32),
    /// Stage a population batch, merged before the next frame runs.
    Ingress(ObjectBatch),
    /// Finish the current frame, drain everything and exit.
    Shutdown,
}

/// Messages out of the physics thread.
pub enum Event {
    /// Entities that left this partition, ready for re-insertion elsewhere.
    Egress(EgressOutput),
    /// Accumulated seconds discarded because the sub-tick budget ran out.
    Dropped(f32),
}

/// Handle to a running physics thread.
pub struct PhysicsRunner {
    commands: Sender<Command>,
    events: Receiver<Event>,
    handle: JoinHandle<Result<(), SimError>>,
}

impl PhysicsRunner {
    /// Spawns the physics thread, moving the gpu instance and the
    /// diagnostics sink into it.
    pub fn spawn(
        gpu: GpuInstance,
        config: SimConfig,
        mut sink: Box<dyn DiagnosticsSink>,
    ) -> Self {
        let (commands, command_rx) = unbounded::<Command>();
        let (event_tx, events) = unbounded::<Event>();
        let handle = std::thread::Builder::new()
            .name("physics".into())
            .spawn(move || run(&gpu, config, &command_rx, &event_tx, sink.as_mut()))
            .expect("failed to spawn the physics thread");
        Self {
            commands,
            events,
            handle,
        }
    }

    /// Hands `dt` wall-clock seconds to the simulation.
    pub fn frame(&self, dt: f32) {
        let _ = self.commands.send(Command::Frame(dt));
    }

    /// Stages a population batch for the next frame.
    pub fn ingress(&self, batch: ObjectBatch) {
        let _ = self.commands.send(Command::Ingress(batch));
    }

    /// Events produced so far; non-blocking consumption is up to the caller.
    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    /// Stops the thread and surfaces its terminal result. Egress output
    /// buffered at exit is still delivered through [`Self::events`] before
    /// this returns.
    pub fn shutdown(self) -> Result<(), SimError> {
        let _ = self.commands.send(Command::Shutdown);
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(SimError::dispatch("physics thread panicked")),
        }
    }
}

fn run(
    gpu: &GpuInstance,
    config: SimConfig,
    commands: &Receiver<Command>,
    events: &Sender<Event>,
    sink: &mut dyn DiagnosticsSink,
) -> Result<(), SimError> {
    let device = gpu.device();
    let queue = gpu.queue();
    let mut pipeline = PhysicsPipeline::new(device, config);
    let step = config.fixed_time_step();
    let mut accumulator = 0.0f32;

    while let Ok(command) = commands.recv() {
        match command {
            Command::Ingress(batch) => {
                pipeline.merge_batch(device, queue, &batch)?;
            }
            Command::Frame(dt) => {
                accumulator += dt;
                let mut stats = RunStats::default();
                let mut executed = 0;
                while accumulator >= step {
                    if executed == config.max_sub_steps {
                        // Out of budget: drop the remainder rather than
                        // spiral on a slow frame.
                        sink.event("dropped", (accumulator * 1.0e9) as u64);
                        let _ = events.send(Event::Dropped(accumulator));
                        accumulator = 0.0;
                        break;
                    }
                    stats.accumulate(&pipeline.step(device, queue, step)?);
                    accumulator -= step;
                    executed += 1;
                }
                let end = pipeline.end_frame(device, queue)?;
                stats.accumulate(&end.stats);
                stats.report(sink);
                if let Some(output) = end.egress {
                    let _ = events.send(Event::Egress(output));
                }
            }
            Command::Shutdown => break,
        }
    }

    // Late ingress still enters the world so a final mirror/egress state is
    // consistent, then buffered departures go out before anything drops.
    while let Ok(command) = commands.try_recv() {
        if let Command::Ingress(batch) = command {
            pipeline.merge_batch(device, queue, &batch)?;
        }
    }
    for output in pipeline.drain_egress(device, queue)? {
        let _ = events.send(Event::Egress(output));
    }
    let _ = device.poll(wgpu::PollType::Wait);
    Ok(())
}

#[cfg(test)]
mod test {
    use nalgebra::point;

    use crate::config::SimConfig;
    use crate::diagnostics::NullSink;
    use crate::gpu::GpuInstance;
    use crate::objects::ObjectBatch;
    use crate::shapes;

    use super::{Event, PhysicsRunner};

    #[futures_test::test]
    #[serial_test::serial]
    async fn frames_run_and_shutdown_drains() {
        let Ok(gpu) = GpuInstance::new().await else {
            return;
        };
        let config = SimConfig::default();
        let runner = PhysicsRunner::spawn(gpu, config, Box::new(NullSink));

        let mut batch = ObjectBatch::new();
        shapes::static_block(&mut batch, point![0.0, -20.0], 30.0, 0.5, 0.0, 0);
        shapes::block(&mut batch, point![0.0, 5.0], 2.0, 1.0, 0.5, 0.0, 1);
        runner.ingress(batch);

        for _ in 0..4 {
            runner.frame(config.tick_rate);
        }
        runner.shutdown().unwrap();
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn departures_come_back_as_events() {
        let Ok(gpu) = GpuInstance::new().await else {
            return;
        };
        let mut config = SimConfig::default();
        // Shrink the partition so the block exits on the first tick.
        config.bounds.min = [-1.0, -1.0];
        config.bounds.max = [1.0, 1.0];
        let runner = PhysicsRunner::spawn(gpu, config, Box::new(NullSink));

        let mut batch = ObjectBatch::new();
        shapes::block(&mut batch, point![0.0, 40.0], 2.0, 1.0, 0.5, 0.0, 11);
        runner.ingress(batch);
        runner.frame(config.tick_rate);
        runner.frame(config.tick_rate);
        let events = runner.events().clone();
        runner.shutdown().unwrap();

        let mut departures = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let Event::Egress(output) = event {
                departures.extend(output.batch.entity_model_ids.clone());
            }
        }
        assert_eq!(departures, vec![11]);
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn dropped_time_is_reported() {
        let Ok(gpu) = GpuInstance::new().await else {
            return;
        };
        let mut config = SimConfig::default();
        config.max_sub_steps = 1;
        let runner = PhysicsRunner::spawn(gpu, config, Box::new(NullSink));

        let mut batch = ObjectBatch::new();
        shapes::particle(&mut batch, point![0.0, 0.0], 1.0, 1.0, 0.5, 0.0, 0);
        runner.ingress(batch);
        // Ten frames of time against a one-sub-tick budget.
        runner.frame(config.tick_rate * 10.0);

        let dropped = runner
            .events()
            .recv_timeout(std::time::Duration::from_secs(30))
            .ok();
        assert!(matches!(dropped, Some(Event::Dropped(_))));
        runner.shutdown().unwrap();
    }
}
