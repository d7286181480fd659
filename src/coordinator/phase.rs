//! Coordinator solve lifecycle.
//!
//! `Idle -> Negotiated -> ReceivingPayload -> Launching -> Distributing ->
//! AwaitingResults -> Assembling -> Done`, with `Failed` reachable from any
//! in-flight state. Each method is one transition; a message arriving in the
//! wrong phase is rejected with `UnexpectedMessage` and the phase is left as is.

use crate::error::SolveError;

/// Shape announced by the requester's `INIT`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub worker_count: usize,
    pub rows: usize,
    pub cols: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Idle,
    Negotiated(Dimensions),
    ReceivingPayload {
        dims: Dimensions,
        slots: Vec<Option<String>>,
        filled: usize,
    },
    Launching(Dimensions),
    Distributing,
    AwaitingResults,
    Assembling,
    Done,
    Failed,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Negotiated(_) => "negotiated",
            Self::ReceivingPayload { .. } => "receiving payload",
            Self::Launching(_) => "launching",
            Self::Distributing => "distributing",
            Self::AwaitingResults => "awaiting results",
            Self::Assembling => "assembling",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// A solve is in flight
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle | Self::Done | Self::Failed)
    }

    /// Block results and health sweeps only matter in these phases
    pub fn accepts_results(&self) -> bool {
        matches!(self, Self::Distributing | Self::AwaitingResults)
    }

    fn reject(&self, message: &'static str) -> SolveError {
        SolveError::UnexpectedMessage {
            message,
            phase: self.name(),
        }
    }

    /// Start negotiating a solve of a non-empty square system on at most `max_workers`
    pub fn on_init(&mut self, dims: Dimensions, max_workers: usize) -> Result<(), SolveError> {
        if self.is_active() {
            return Err(self.reject("INIT"));
        }
        if dims.rows == 0 || dims.rows != dims.cols {
            return Err(SolveError::InvalidPayload(format!(
                "system must be square and non-empty, got {}x{}",
                dims.rows, dims.cols
            )));
        }
        if dims.worker_count > max_workers {
            return Err(SolveError::InvalidPayload(format!(
                "{} workers requested, at most {} allowed",
                dims.worker_count, max_workers
            )));
        }
        *self = Self::Negotiated(dims);
        Ok(())
    }

    /// Every chunk carries at least one whole row, so the count is bounded by `rows`
    pub fn on_count(&mut self, chunk_count: usize) -> Result<(), SolveError> {
        let Self::Negotiated(dims) = *self else {
            return Err(self.reject("COUNT"));
        };
        if chunk_count == 0 || chunk_count > dims.rows {
            return Err(SolveError::InvalidPayload(format!(
                "{} chunks announced for {} rows",
                chunk_count, dims.rows
            )));
        }
        *self = Self::ReceivingPayload {
            dims,
            slots: vec![None; chunk_count],
            filled: 0,
        };
        Ok(())
    }

    /// Fill one payload slot; returns the joined payload once every slot is filled
    pub fn on_chunk(&mut self, index: usize, data: &str) -> Result<Option<(Dimensions, String)>, SolveError> {
        let Self::ReceivingPayload { dims, slots, filled } = &mut *self else {
            return Err(self.reject("CHUNK"));
        };
        let total = slots.len();
        let slot = slots.get_mut(index).ok_or_else(|| {
            SolveError::InvalidPayload(format!("chunk index {} outside 0..{}", index, total))
        })?;
        if slot.is_none() {
            *slot = Some(data.to_string());
            *filled += 1;
        }
        if *filled < total {
            return Ok(None);
        }

        let dims = *dims;
        let payload = slots
            .iter_mut()
            .filter_map(Option::take)
            .collect::<Vec<_>>()
            .join("\n");
        *self = Self::Launching(dims);
        Ok(Some((dims, payload)))
    }

    pub fn begin_distribution(&mut self) -> Result<(), SolveError> {
        if !matches!(self, Self::Launching(_)) {
            return Err(self.reject("distribution start"));
        }
        *self = Self::Distributing;
        Ok(())
    }

    /// Every task has been sent; a no-op if the solve already moved on
    pub fn distribution_done(&mut self) {
        if matches!(self, Self::Distributing) {
            *self = Self::AwaitingResults;
        }
    }

    pub fn begin_assembly(&mut self) -> Result<(), SolveError> {
        if !self.accepts_results() {
            return Err(self.reject("final block"));
        }
        *self = Self::Assembling;
        Ok(())
    }

    pub fn finish(&mut self) -> Result<(), SolveError> {
        if !matches!(self, Self::Assembling | Self::Launching(_)) {
            return Err(self.reject("solution"));
        }
        *self = Self::Done;
        Ok(())
    }

    pub fn fail(&mut self) {
        *self = Self::Failed;
    }

    pub fn reset(&mut self) {
        *self = Self::Idle;
    }
}
