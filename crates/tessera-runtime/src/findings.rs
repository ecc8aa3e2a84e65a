use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde_json::json;
use tessera_types::{ChangeKind, Fid, Finding, FindingKind, MutationEnvelope, Severity};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FindingConfig {
    /// Consecutive commits with an attribute diff before identity thrash is
    /// reported.
    pub thrash_streak: u32,
    /// Updates within `runaway_window` before a runaway loop is reported.
    pub runaway_updates: usize,
    pub runaway_window: Duration,
}

impl Default for FindingConfig {
    fn default() -> Self {
        Self {
            thrash_streak: 3,
            runaway_updates: 6,
            runaway_window: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default)]
struct Track {
    streak: u32,
    last_attr_commit: Option<u64>,
    updates: VecDeque<Instant>,
    last_runaway: Option<Instant>,
}

/// Derives advisory findings from the change stream. Purely observational.
#[derive(Debug, Default)]
pub struct FindingEngine {
    config: FindingConfig,
    next_id: u64,
    tracks: HashMap<Fid, Track>,
}

impl FindingEngine {
    pub fn new(config: FindingConfig) -> Self {
        Self {
            config,
            next_id: 0,
            tracks: HashMap::new(),
        }
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    pub fn observe(&mut self, envelope: &MutationEnvelope, now: Instant) -> Vec<Finding> {
        let mut found = Vec::new();
        for record in &envelope.changes {
            match record.kind {
                ChangeKind::Unmount => {
                    self.tracks.remove(&record.fid);
                    continue;
                }
                ChangeKind::Mount => continue,
                ChangeKind::Update => {}
            }

            let config = self.config;
            let track = self.tracks.entry(record.fid).or_default();
            let mut emit = Vec::new();

            if let Some(diff) = &record.attr_diff {
                let consecutive = track
                    .last_attr_commit
                    .is_some_and(|last| last + 1 == envelope.sequence_no);
                track.streak = if consecutive { track.streak + 1 } else { 1 };
                track.last_attr_commit = Some(envelope.sequence_no);
                if track.streak == config.thrash_streak {
                    let fields: Vec<&str> = diff.keys().collect();
                    emit.push((
                        FindingKind::IdentityThrash,
                        Severity::Medium,
                        json!({
                            "changedFields": fields,
                            "consecutiveCommits": track.streak,
                        }),
                        format!(
                            "{} received new attributes on {} consecutive commits; check whether its parent recreates values (objects, callbacks) on every render",
                            record.name, track.streak
                        ),
                    ));
                }
            }

            track.updates.push_back(now);
            while track
                .updates
                .front()
                .is_some_and(|t| now.saturating_duration_since(*t) > config.runaway_window)
            {
                track.updates.pop_front();
            }
            let rearmed = track
                .last_runaway
                .is_none_or(|t| now.saturating_duration_since(t) >= config.runaway_window);
            if track.updates.len() >= config.runaway_updates && rearmed {
                track.last_runaway = Some(now);
                emit.push((
                    FindingKind::RunawayUpdateLoop,
                    Severity::High,
                    json!({
                        "updatesLast1s": track.updates.len(),
                        "windowMs": config.runaway_window.as_millis() as u64,
                    }),
                    format!(
                        "{} updated {} times within {}ms; look for an effect or subscription that updates state unconditionally",
                        record.name,
                        track.updates.len(),
                        config.runaway_window.as_millis()
                    ),
                ));
            }

            for (kind, severity, evidence, suggestion) in emit {
                self.next_id += 1;
                found.push(Finding {
                    id: format!("finding-{}", self.next_id),
                    kind,
                    severity,
                    fid: record.fid,
                    name: record.name.clone(),
                    evidence,
                    suggestion,
                });
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::{ChangeReason, ChangeRecord, FieldDiff};

    fn update(fid: Fid, attrs: bool) -> ChangeRecord {
        ChangeRecord {
            fid,
            kind: ChangeKind::Update,
            name: "Spinner".into(),
            parent_fid: None,
            key: None,
            reasons: vec![if attrs {
                ChangeReason::Attrs
            } else {
                ChangeReason::State
            }],
            attr_diff: attrs.then(|| FieldDiff {
                changed: vec!["style".into()],
                ..FieldDiff::default()
            }),
            state_diff: None,
            context_diff: None,
            source_pos: None,
        }
    }

    fn envelope(sequence_no: u64, changes: Vec<ChangeRecord>) -> MutationEnvelope {
        MutationEnvelope {
            session_id: "session-test".into(),
            sequence_no,
            timestamp: 0,
            duration_ms: 0.0,
            changes,
            coalesced: None,
        }
    }

    #[test]
    fn six_updates_within_900ms_report_one_runaway_loop() {
        let mut engine = FindingEngine::default();
        let fid = Fid::new(4, 0);
        let start = Instant::now();
        let mut findings = Vec::new();
        for i in 0..6u64 {
            let now = start + Duration::from_millis(i * 180);
            findings.extend(engine.observe(&envelope(i + 1, vec![update(fid, false)]), now));
        }
        let runaway: Vec<_> = findings
            .iter()
            .filter(|f| f.kind == FindingKind::RunawayUpdateLoop)
            .collect();
        assert_eq!(runaway.len(), 1);
        assert_eq!(runaway[0].severity, Severity::High);
        assert!(runaway[0].evidence["updatesLast1s"].as_u64().unwrap() >= 6);
    }

    #[test]
    fn runaway_reports_at_most_once_per_window() {
        let mut engine = FindingEngine::default();
        let fid = Fid::new(1, 0);
        let start = Instant::now();
        let mut count = 0;
        for i in 0..20u64 {
            let now = start + Duration::from_millis(i * 50);
            count += engine
                .observe(&envelope(i + 1, vec![update(fid, false)]), now)
                .len();
        }
        // 20 updates over 950ms: one report.
        assert_eq!(count, 1);
    }

    #[test]
    fn thrash_reports_once_per_streak() {
        let mut engine = FindingEngine::default();
        let fid = Fid::new(2, 0);
        let start = Instant::now();
        let mut kinds = Vec::new();
        // Commits 1-4 thrash, 5 skips, 6-8 thrash again. Spaced out so the
        // runaway detector stays quiet.
        for seq in [1u64, 2, 3, 4, 6, 7, 8] {
            let now = start + Duration::from_secs(seq);
            for finding in engine.observe(&envelope(seq, vec![update(fid, true)]), now) {
                kinds.push((seq, finding.kind, finding.evidence["consecutiveCommits"].clone()));
            }
        }
        assert_eq!(
            kinds,
            vec![
                (3, FindingKind::IdentityThrash, json!(3)),
                (8, FindingKind::IdentityThrash, json!(3)),
            ]
        );
    }
}
