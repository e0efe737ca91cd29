//! 任务注册表
//!
//! 每个打码任务一条记录；进度与终态由工作线程写入，调用方随时查询。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use log::{debug, info};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::{ErrorKind, JobFailure};
use crate::core::video::progress::ProgressReporter;

pub type JobId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing {
        progress: u8,
    },
    Completed {
        progress: u8,
        output_file: PathBuf,
        /// 合流失败时的原因，此时输出为无声视频
        remux_error: Option<String>,
    },
    Failed {
        error: JobFailure,
    },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed { .. } | JobStatus::Failed { .. })
    }

    pub fn progress(&self) -> u8 {
        match self {
            JobStatus::Pending | JobStatus::Failed { .. } => 0,
            JobStatus::Processing { progress } | JobStatus::Completed { progress, .. } => *progress,
        }
    }
}

#[derive(Debug)]
pub struct JobRecord {
    id: JobId,
    status: Mutex<JobStatus>,
}

impl JobRecord {
    fn new(id: JobId) -> Self {
        Self {
            id,
            status: Mutex::new(JobStatus::Pending),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> JobStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 进度只增不减；终态后忽略
    pub fn set_progress(&self, percent: u8) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        let advance = match &*status {
            JobStatus::Pending => true,
            JobStatus::Processing { progress } => percent > *progress,
            _ => false,
        };
        if advance {
            *status = JobStatus::Processing {
                progress: percent.min(100),
            };
        }
    }

    pub fn complete(&self, output_file: &Path, remux_error: Option<&str>) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if status.is_terminal() {
            return;
        }
        *status = JobStatus::Completed {
            progress: 100,
            output_file: output_file.to_path_buf(),
            remux_error: remux_error.map(str::to_string),
        };
        info!("✅ Job {} completed: {:?}", self.id, output_file);
    }

    pub fn fail(&self, failure: JobFailure) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if status.is_terminal() {
            return;
        }
        info!("❌ Job {} failed: {}", self.id, failure);
        *status = JobStatus::Failed { error: failure };
    }
}

/// 把管线回调写入任务记录
pub struct JobReporter(Arc<JobRecord>);

impl JobReporter {
    pub fn new(record: Arc<JobRecord>) -> Self {
        Self(record)
    }
}

impl ProgressReporter for JobReporter {
    fn on_progress(&self, percent: u8) {
        self.0.set_progress(percent);
    }

    fn on_complete(&self, output_path: &Path, remux_error: Option<&str>) {
        self.0.complete(output_path, remux_error);
    }

    fn on_failure(&self, kind: ErrorKind, message: &str) {
        self.0.fail(JobFailure::new(kind, message));
    }
}

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Arc<JobRecord>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> Arc<JobRecord> {
        let id = Uuid::new_v4().to_string();
        let record = Arc::new(JobRecord::new(id.clone()));
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Arc::clone(&record));
        debug!("Job {} registered", id);
        record
    }

    pub fn get(&self, id: &str) -> Option<Arc<JobRecord>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn status(&self, id: &str) -> Option<JobStatus> {
        self.get(id).map(|record| record.status())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<JobRecord>> {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn len(&self) -> usize {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 进程内全局任务表
pub static JOBS: Lazy<JobRegistry> = Lazy::new(JobRegistry::new);
