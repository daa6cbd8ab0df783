//! Startup recovery: snapshot first, then journal replay, then persisted term state.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::RaftConfig;
use crate::error::Result;
use crate::journal::{EntryJournal, TermInfo, TermInfoStore};
use crate::log::{Payload, ReplicatedLog};
use crate::snapshot::{SnapshotManager, SnapshotStore};
use crate::state_machine::StateMachine;
use crate::types::ServerConfig;

/// Everything reconstructed from stable storage at startup.
pub(crate) struct Recovered {
    pub log: ReplicatedLog,
    pub term_info: TermInfo,
    pub server_config: Option<ServerConfig>,
    pub journal: Option<EntryJournal>,
    pub term_store: Option<TermInfoStore>,
    pub snapshots: SnapshotManager,
}

/// Rebuild node state from the configured storage directory.
///
/// The latest snapshot restores the state machine and the log boundary; journal entries
/// above the boundary are replayed into the in-memory log (uncommitted from our point of
/// view until a leader re-establishes the commit index); the persisted term info wins
/// over the snapshot's copy when both exist.
pub(crate) async fn recover(
    config: &RaftConfig,
    state_machine: &Arc<dyn StateMachine>,
) -> Result<Recovered> {
    let Some(dir) = &config.storage_dir else {
        return Ok(Recovered {
            log: ReplicatedLog::new(),
            term_info: TermInfo::default(),
            server_config: None,
            journal: None,
            term_store: None,
            snapshots: SnapshotManager::new(
                None,
                config.snapshot_batch_count,
                config.snapshot_data_threshold,
            ),
        });
    };

    let store = SnapshotStore::new(dir.join("snapshots"), config.retained_snapshots)?;
    let term_store = TermInfoStore::new(dir)?;
    let (journal, replayed) =
        EntryJournal::open(dir.join("journal"), config.journal_segment_size)?;

    let mut log = ReplicatedLog::new();
    let mut server_config = None;
    let mut term_info = TermInfo::default();

    if let Some(snapshot) = store.load_latest()? {
        info!(
            index = snapshot.last_applied_index,
            term = snapshot.last_applied_term,
            "recovering from snapshot"
        );
        state_machine
            .install_snapshot(snapshot.state.clone())
            .await?;
        log.reset_to_snapshot(snapshot.last_applied_index, snapshot.last_applied_term);
        server_config = snapshot.server_config.clone();
        term_info = snapshot.term_info.clone();

        if !snapshot.unapplied_entries.is_empty() {
            log.append_received(&snapshot.unapplied_entries)?;
        }
    }

    let boundary = log.snapshot_index();
    let above: Vec<_> = replayed
        .into_iter()
        .filter(|e| e.index > boundary)
        .collect();
    if !above.is_empty() {
        if above[0].index > log.last_index() + 1 {
            // The journal no longer lines up with the snapshot; entries in the gap are
            // unrecoverable, so the leader will have to re-install a snapshot.
            warn!(
                journal_first = above[0].index,
                log_last = log.last_index(),
                "journal does not line up with snapshot, discarding journal entries"
            );
        } else {
            let added = log.append_received(&above)?;
            info!(count = added.len(), "replayed journal entries");
        }
    }

    // Replicated configurations apply on append; the newest one wins.
    for index in (log.snapshot_index() + 1..=log.last_index()).rev() {
        if let Some(entry) = log.get(index) {
            if let Payload::VotingConfig(config) = &entry.payload {
                server_config = Some(config.clone());
                break;
            }
        }
    }

    if let Some(persisted) = term_store.load()? {
        if persisted.term >= term_info.term {
            term_info = persisted;
        }
    }

    info!(
        last_index = log.last_index(),
        snapshot_index = log.snapshot_index(),
        term = term_info.term,
        "recovery complete"
    );
    Ok(Recovered {
        log,
        term_info,
        server_config,
        journal: Some(journal),
        term_store: Some(term_store),
        snapshots: SnapshotManager::new(
            Some(store),
            config.snapshot_batch_count,
            config.snapshot_data_threshold,
        ),
    })
}
