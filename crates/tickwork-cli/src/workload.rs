//! Demonstration workload.
//!
//! Installs a handful of tasks that exercise every kernel primitive:
//!
//! - a consumer and a producer sharing the `items` signal,
//! - two workers taking turns on the `workbench` lock,
//! - a periodic `heartbeat` timer that stops itself after a few firings,
//! - a sleeping `reporter` woken by a watch once the producer is gone.

use std::cell::Cell;
use std::rc::Rc;

use anyhow::{Context as _, Result};
use tickwork_kernel::{
    Context, Disposition, Kernel, LockId, Program, SignalId, SignalRequest, TaskId, TimerControl,
    WaitRequest, watch,
};
use tracing::info;

/// Items the producer makes before it exits.
const ITEMS: u32 = 5;
/// Critical sections each worker enters.
const ROUNDS: u32 = 3;
/// Heartbeat firings before the timer stops itself.
const HEARTBEATS: u32 = 3;
const HEARTBEAT_PERIOD: u64 = 3;

/// Handles to what the workload installed.
#[derive(Debug, Clone)]
pub struct Workload {
    pub items: SignalId,
    pub workbench: LockId,
    pub producer: TaskId,
    pub consumer: TaskId,
    pub workers: Vec<TaskId>,
    pub reporter: TaskId,
    pub heartbeats: Rc<Cell<u32>>,
}

/// Create every demo task, primitive, timer and watch.
pub fn install(kernel: &mut Kernel) -> Result<Workload> {
    let items = kernel.create_signal(0);
    let workbench = kernel.create_lock();

    let consumer = kernel
        .create_task_with_store(consumer(items), 0, "consumer", false)
        .context("failed to create consumer")?;
    let producer = kernel
        .create_task_with_store(producer(items), 0, "producer", false)
        .context("failed to create producer")?;

    let workers = ["worker-a", "worker-b"]
        .into_iter()
        .map(|name| {
            kernel
                .create_task_with_store(worker(workbench), 0, name, false)
                .with_context(|| format!("failed to create {name}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let heartbeats = Rc::new(Cell::new(0));
    let first = kernel.current_tick() + 2;
    kernel
        .schedule(first, heartbeat, heartbeats.clone(), "heartbeat", Some(HEARTBEAT_PERIOD))
        .context("failed to schedule heartbeat")?;

    // The reporter sleeps until the producer has exited.
    let mut spawn_reporter = watch::after(
        |kernel: &mut Kernel, name: &String| {
            kernel.create_task(reporter(), name.clone(), true)
        },
        move |kernel: &mut Kernel, created: &tickwork_kernel::Result<TaskId>, _: &String| {
            if let Ok(id) = created {
                kernel.register_watch(move |k: &Kernel| !k.contains_task(producer), vec![*id]);
            }
        },
    );
    let reporter = spawn_reporter(kernel, &"reporter".to_string())
        .context("failed to create reporter")?;

    info!(
        tasks = kernel.task_count(),
        items = %items,
        workbench = %workbench,
        "workload installed"
    );

    Ok(Workload {
        items,
        workbench,
        producer,
        consumer,
        workers,
        reporter,
        heartbeats,
    })
}

fn producer(items: SignalId) -> Program<u32> {
    Program::new()
        .tagged("produce", move |cx: &mut Context<'_>, _: &mut u32| {
            cx.signal(&[SignalRequest::new(items, 1)])
        })
        .op(|cx: &mut Context<'_>, produced: &mut u32| {
            *produced += 1;
            info!(task_id = %cx.task_id(), produced = *produced, "item produced");
            if *produced < ITEMS {
                Disposition::StopToLabel("produce".into())
            } else {
                Disposition::Continue
            }
        })
}

fn consumer(items: SignalId) -> Program<u32> {
    Program::new()
        .tagged("consume", move |cx: &mut Context<'_>, _: &mut u32| {
            cx.wait(&[WaitRequest::take(items, 1)])
        })
        .op(|cx: &mut Context<'_>, consumed: &mut u32| {
            *consumed += 1;
            info!(task_id = %cx.task_id(), consumed = *consumed, "item consumed");
            if *consumed < ITEMS {
                Disposition::StopToLabel("consume".into())
            } else {
                Disposition::Continue
            }
        })
}

/// Hold the lock across one pass, release it, repeat.
fn worker(lock: LockId) -> Program<u32> {
    Program::new()
        .tagged("acquire", move |cx: &mut Context<'_>, _: &mut u32| cx.acquire(lock))
        .op(|cx: &mut Context<'_>, round: &mut u32| {
            info!(task_id = %cx.task_id(), round = *round, tick = cx.tick(), "working at bench");
            Disposition::StopAdvanceCursor
        })
        .op(move |cx: &mut Context<'_>, _: &mut u32| cx.release(lock))
        .op(|_, round: &mut u32| {
            *round += 1;
            if *round < ROUNDS {
                Disposition::StopToLabel("acquire".into())
            } else {
                Disposition::Continue
            }
        })
}

fn reporter() -> Program {
    Program::new().op(|cx: &mut Context<'_>, _: &mut ()| {
        let tick = cx.tick();
        let kernel = cx.kernel();
        info!(tick, tasks = kernel.task_count(), "producer exited, reporter awake");
        Disposition::Sleep
    })
}

fn heartbeat(kernel: &mut Kernel, beats: &Rc<Cell<u32>>) -> TimerControl {
    beats.set(beats.get() + 1);
    info!(tick = kernel.current_tick(), beat = beats.get(), "heartbeat");
    if beats.get() >= HEARTBEATS {
        TimerControl::Stop
    } else {
        TimerControl::Keep
    }
}
