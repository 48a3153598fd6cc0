//! Runtime configuration.
//!
//! Constructed in-process (there is no file/env format in scope — see
//! SPEC_FULL.md §0); mirrors the original's per-instance `ocrParamList_t`
//! blocks passed to each factory at `newXxx()` time.

/// Tunables for the strand table, event waiter spill, and strand
/// processing throughput.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Strand-table fan-out per interior node. Spec default: 64.
    pub strand_table_fanout: u32,
    /// Waiters kept inline on an event before spilling to a dynamic
    /// overflow datablock. Spec: `HCEVT_WAITER_STATIC_COUNT` ≈ 4.
    pub event_waiter_static_count: usize,
    /// Initial size of the dynamic overflow waiter datablock once an event
    /// spills. Spec: `HCEVT_WAITER_DYNAMIC_COUNT`.
    pub event_waiter_dynamic_count: usize,
    /// Cap on actions executed per call to `pdProcessStrands` before
    /// yielding, unless draining during shutdown. Spec:
    /// `PDPROCESS_MAX_COUNT`.
    pub pd_process_max_count: u32,
    /// Number of worker threads this policy domain owns.
    pub worker_count: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            strand_table_fanout: 64,
            event_waiter_static_count: 4,
            event_waiter_dynamic_count: 8,
            pd_process_max_count: 64,
            worker_count: 1,
        }
    }
}
