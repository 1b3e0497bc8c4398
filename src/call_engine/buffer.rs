//! Negotiation Buffer
//!
//! ICE Candidates der Gegenseite können vor deren Session Description
//! ankommen. Solange keine Remote Description gesetzt ist, werden sie hier
//! in Ankunftsreihenfolge gehalten und danach genau einmal angewendet.

use super::transport::MediaTransport;
use crate::signaling::IceCandidate;
use std::collections::VecDeque;

/// Ergebnis eines Drain-Durchlaufs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub failed: usize,
}

/// FIFO-Puffer für verfrühte ICE Candidates (eine Instanz pro Peer Session)
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hängt einen Candidate an (nur solange keine Remote Description gesetzt ist)
    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Verwirft alle gepufferten Candidates und gibt deren Anzahl zurück
    pub fn reset(&mut self) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        discarded
    }

    /// Wendet alle gepufferten Candidates in Ankunftsreihenfolge an
    ///
    /// Fehler einzelner Candidates werden geloggt und brechen den Drain nicht ab.
    /// Danach ist der Puffer leer.
    pub async fn drain(&mut self, transport: &dyn MediaTransport) -> DrainReport {
        let mut report = DrainReport::default();

        if self.pending.is_empty() {
            return report;
        }

        tracing::info!("Adding {} buffered ICE candidates", self.pending.len());

        while let Some(candidate) = self.pending.pop_front() {
            match transport.add_ice_candidate(candidate).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    tracing::error!("Error adding buffered ICE candidate: {}", e);
                    report.failed += 1;
                }
            }
        }

        report
    }
}

// ============================================================================
// TESTS
// ============================================================================
