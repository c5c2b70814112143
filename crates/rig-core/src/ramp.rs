use serde::{Deserialize, Serialize};

use crate::config::{LoadConfig, LoadShapeKind, Stage};

/// When one VU starts (and, for staged runs, when it is retired), both as
/// offsets from the burst start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VuStart {
    pub vu_id: u64,
    pub offset_ms: u64,
    pub retire_at_ms: Option<u64>,
}

/// Deterministic start planner: identical inputs always give identical
/// schedules, so every worker process computes the same global plan and
/// keeps its own slice.
#[derive(Debug, Clone)]
pub struct RampPlanner {
    shape: LoadShapeKind,
    total: u64,
    batch_size: u64,
    batch_interval_ms: u64,
    jitter_ms: u64,
    stages: Vec<Stage>,
}

/// Deterministic per-VU jitter in `[0, jitter_ms)`.
pub fn jitter_for(vu_id: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return 0;
    }
    vu_id.wrapping_mul(1_103_515_245).wrapping_add(12_345) % jitter_ms
}

impl RampPlanner {
    pub fn new(config: &LoadConfig) -> Self {
        Self {
            shape: config.shape,
            total: config.total_vus(),
            batch_size: config.batch_size.max(1),
            batch_interval_ms: config.batch_interval_ms,
            jitter_ms: config.jitter_ms,
            stages: config.stages.clone(),
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Length of the staged curve in milliseconds (0 for other shapes).
    pub fn total_duration_ms(&self) -> u64 {
        match self.shape {
            LoadShapeKind::Staged => self.stages.iter().map(|s| s.duration_ms).sum(),
            _ => 0,
        }
    }

    /// Number of VUs across all processes the shape ever starts.
    pub fn reached(&self) -> u64 {
        (1..=self.total).filter(|id| self.start_for(*id).is_some()).count() as u64
    }

    /// Start schedule for one VU, or `None` when the shape never reaches it.
    pub fn start_for(&self, vu_id: u64) -> Option<VuStart> {
        match self.shape {
            LoadShapeKind::Fixed => Some(VuStart {
                vu_id,
                offset_ms: 0,
                retire_at_ms: None,
            }),
            LoadShapeKind::Batched => {
                let batch = (vu_id.max(1) - 1) / self.batch_size;
                Some(VuStart {
                    vu_id,
                    offset_ms: batch * self.batch_interval_ms + jitter_for(vu_id, self.jitter_ms),
                    retire_at_ms: None,
                })
            }
            LoadShapeKind::Staged => self.staged_start(vu_id),
        }
    }

    /// VU `k` starts when the curve first reaches `k` and retires when it
    /// later falls below `k`.
    fn staged_start(&self, k: u64) -> Option<VuStart> {
        let mut t0 = 0u64;
        let mut v0 = 0u64;
        let mut start = None;

        for stage in &self.stages {
            let (dur, v1) = (stage.duration_ms, stage.target);
            match start {
                None if v1 > v0 && k > v0 && k <= v1 => {
                    // first t with v0 + (v1 - v0) * (t - t0) / dur >= k
                    let offset = if dur == 0 {
                        0
                    } else {
                        ((k - v0) * dur).div_ceil(v1 - v0)
                    };
                    start = Some(t0 + offset);
                }
                Some(started) if v1 < v0 && k > v1 && k <= v0 => {
                    // first t with v0 - (v0 - v1) * (t - t0) / dur < k
                    let offset = if dur == 0 { 0 } else { (v0 - k) * dur / (v0 - v1) + 1 };
                    return Some(VuStart {
                        vu_id: k,
                        offset_ms: started,
                        retire_at_ms: Some((t0 + offset).max(started)),
                    });
                }
                _ => {}
            }
            t0 += dur;
            v0 = v1;
        }

        start.map(|offset_ms| VuStart {
            vu_id: k,
            offset_ms,
            retire_at_ms: None,
        })
    }

    /// Schedules for the given VU ids, sorted by start offset. VUs the shape
    /// never reaches are left out.
    pub fn plan(&self, vu_ids: impl IntoIterator<Item = u64>) -> Vec<VuStart> {
        let mut starts: Vec<VuStart> = vu_ids
            .into_iter()
            .filter(|id| *id <= self.total)
            .filter_map(|id| self.start_for(id))
            .collect();
        starts.sort_by_key(|s| (s.offset_ms, s.vu_id));
        starts
    }
}
