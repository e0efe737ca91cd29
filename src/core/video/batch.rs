//! 批处理执行器
//!
//! 帧按到达顺序攒成批，每批交给线程池中的一个任务。批次并行执行，
//! 但结果严格按提交顺序取回：驱动线程总是等待最早的在途批次。

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;

use log::{debug, error, info};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::core::config::{CensorMode, PipelineConfig};
use crate::core::error::PipelineError;
use crate::core::faces::{ReferenceSet, RegionEncoder, RegionMatcher};
use crate::core::video::censor::CensorTransform;
use crate::core::video::frame::{Frame, Region};

/// 带区域标注的帧
#[derive(Debug, Clone)]
pub struct TaggedFrame {
    pub frame: Frame,
    pub regions: Vec<Region>,
}

pub type Batch = Vec<TaggedFrame>;

/// 按到达顺序累积帧，满 capacity 时整批取出
pub struct BatchBuffer {
    capacity: usize,
    items: Batch,
}

impl BatchBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, frame: Frame, regions: Vec<Region>) -> Option<Batch> {
        self.items.push(TaggedFrame { frame, regions });
        if self.items.len() >= self.capacity {
            Some(std::mem::replace(
                &mut self.items,
                Vec::with_capacity(self.capacity),
            ))
        } else {
            None
        }
    }

    /// 流结束时取出不足一批的剩余帧
    pub fn flush(&mut self) -> Option<Batch> {
        if self.items.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.items))
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// 单帧处理统计
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameReport {
    pub censored: usize,
    pub skipped: usize,
}

/// 工作线程共享的只读上下文
pub struct CensorContext {
    mode: CensorMode,
    transform: CensorTransform,
    tolerance: f32,
    references: Arc<ReferenceSet>,
    encoder: Arc<dyn RegionEncoder>,
    matcher: Arc<dyn RegionMatcher>,
}

impl CensorContext {
    pub fn new(
        config: &PipelineConfig,
        references: Arc<ReferenceSet>,
        encoder: Arc<dyn RegionEncoder>,
        matcher: Arc<dyn RegionMatcher>,
    ) -> Self {
        Self {
            mode: config.mode,
            transform: CensorTransform::from_config(config),
            tolerance: config.match_tolerance,
            references,
            encoder,
            matcher,
        }
    }

    pub fn censor_frame(&self, frame: &mut Frame, regions: &[Region]) -> FrameReport {
        let mut report = FrameReport::default();

        if regions.is_empty() || (self.mode.needs_matching() && self.references.is_empty()) {
            return report;
        }

        for region in regions {
            if !self.should_censor(frame, region) {
                continue;
            }
            match self.transform.apply(&mut frame.image, region) {
                Ok(()) => report.censored += 1,
                Err(e) => {
                    debug!("Frame {}: skipping region: {}", frame.frame_number, e);
                    report.skipped += 1;
                }
            }
        }

        report
    }

    fn should_censor(&self, frame: &Frame, region: &Region) -> bool {
        let matched = match self.mode {
            CensorMode::All => return true,
            CensorMode::One | CensorMode::AllExcept => {
                match self.encoder.encode(&frame.image, region) {
                    Ok(fingerprint) => self.matcher.matches(
                        &fingerprint,
                        self.references.as_slice(),
                        self.tolerance,
                    ),
                    Err(e) => {
                        debug!("Frame {}: {}", frame.frame_number, e);
                        return false;
                    }
                }
            }
        };

        match self.mode {
            CensorMode::One => matched,
            _ => !matched,
        }
    }
}

/// 顺序处理一批帧，输出顺序与输入一致
pub fn process_batch(batch: Batch, context: &CensorContext) -> Vec<Frame> {
    batch
        .into_iter()
        .map(|TaggedFrame { mut frame, regions }| {
            context.censor_frame(&mut frame, &regions);
            frame
        })
        .collect()
}

struct InFlight {
    sequence: u64,
    receiver: Receiver<Vec<Frame>>,
}

/// 线程池生命周期与执行器一致，drop 即释放
pub struct BatchExecutor {
    pool: ThreadPool,
    context: Arc<CensorContext>,
    in_flight: VecDeque<InFlight>,
    max_in_flight: usize,
    next_sequence: u64,
}

impl BatchExecutor {
    pub fn new(
        worker_count: usize,
        max_in_flight: usize,
        context: CensorContext,
    ) -> Result<Self, PipelineError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(worker_count.max(1))
            .thread_name(|i| format!("censor-worker-{}", i))
            .panic_handler(|_| error!("❌ Censor worker panicked, batch dropped"))
            .build()
            .map_err(|e| PipelineError::WorkerPool(e.to_string()))?;

        info!("🔧 Worker pool started with {} threads", pool.current_num_threads());

        Ok(Self {
            pool,
            context: Arc::new(context),
            in_flight: VecDeque::new(),
            max_in_flight: max_in_flight.max(1),
            next_sequence: 0,
        })
    }

    /// 派发一批；返回此刻已按序完成的帧（可能为空）
    ///
    /// 在途批次超过上限时阻塞等待最早的批次。
    pub fn submit(&mut self, batch: Batch) -> Result<Vec<Frame>, PipelineError> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let (tx, rx) = mpsc::sync_channel(1);
        let context = Arc::clone(&self.context);
        let len = batch.len();
        self.pool.spawn(move || {
            let frames = process_batch(batch, &context);
            // 接收端已释放说明任务被放弃
            let _ = tx.send(frames);
        });
        debug!("Batch {} dispatched ({} frames)", sequence, len);

        self.in_flight.push_back(InFlight {
            sequence,
            receiver: rx,
        });

        let mut ready = Vec::new();
        while self.in_flight.len() > self.max_in_flight {
            ready.extend(self.await_oldest()?);
        }
        ready.extend(self.collect_finished()?);
        Ok(ready)
    }

    /// 等待全部在途批次，按提交顺序返回
    pub fn drain(&mut self) -> Result<Vec<Frame>, PipelineError> {
        let mut frames = Vec::new();
        while !self.in_flight.is_empty() {
            frames.extend(self.await_oldest()?);
        }
        Ok(frames)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn dispatched(&self) -> u64 {
        self.next_sequence
    }

    fn await_oldest(&mut self) -> Result<Vec<Frame>, PipelineError> {
        match self.in_flight.pop_front() {
            Some(pending) => pending.receiver.recv().map_err(|_| {
                PipelineError::WorkerPool(format!("batch {} was lost", pending.sequence))
            }),
            None => Ok(Vec::new()),
        }
    }

    /// 不阻塞地取出队首已完成的批次
    fn collect_finished(&mut self) -> Result<Vec<Frame>, PipelineError> {
        let mut frames = Vec::new();
        while let Some(pending) = self.in_flight.front() {
            let sequence = pending.sequence;
            match pending.receiver.try_recv() {
                Ok(done) => {
                    frames.extend(done);
                    self.in_flight.pop_front();
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    return Err(PipelineError::WorkerPool(format!(
                        "batch {} was lost",
                        sequence
                    )));
                }
            }
        }
        Ok(frames)
    }
}
