//! The consensus driver.
//!
//! One task owns the [`RoundState`] and serializes every input that can
//! mutate it: messages from peers, self-authored messages, timeouts, and
//! the mempool's txs-available signal. Each input is appended to the WAL
//! before it is dispatched; self-authored messages are fsynced, because a
//! lost record there risks double-signing after a restart.
//!
//! Step transitions follow the classic two-phase-vote structure:
//!
//! ```text
//! NewHeight → NewRound(r) → Propose(r) → Prevote(r) → PrevoteWait(r)
//!     → Precommit(r) → PrecommitWait(r) → NewRound(r+1) | Commit
//! ```
//!
//! Every `enter_*` is guarded by "same height, round not earlier, step not
//! later than target"; stale or duplicate entries are rejected no-ops.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use kestrel_config::ConsensusConfig;
use kestrel_crypto::PublicKey;
use kestrel_types::{
    now_ms, Address, BlockId, Commit, ExtendedCommit, Part, PartSet, PartSetHeader, Proposal,
    State, Timestamp, Vote, VoteType,
};

use crate::events::{ConsensusEvent, EventBus};
use crate::round_state::{RoundState, Step};
use crate::timeout::{TimeoutInfo, TimeoutTicker};
use crate::traits::{
    BlockExecutor, BlockStore, EvidencePool, PrivValidator, StateStore, TxNotifier,
};
use crate::types::{Message, MsgInfo, PeerId};
use crate::vote_set::{HeightVoteSet, VoteSet, VoteSetError};
use crate::wal::{self, Wal, WalError, WalMessage};

/// Fatal driver errors. Everything recoverable is logged and absorbed.
#[derive(Debug, Error)]
pub enum DriverError {
    /// A store failed
    #[error("store error: {0}")]
    Store(#[from] crate::traits::StoreError),

    /// The WAL failed in a way replay/repair could not fix
    #[error("wal error: {0}")]
    Wal(#[from] WalError),

    /// Our key already signed a commit within the lookback window
    #[error("found our own signature in the commit at height {height}; refusing to start")]
    DoubleSignRisk {
        /// Height carrying our signature
        height: u64,
    },

    /// The driver is gone
    #[error("consensus driver channel closed")]
    ChannelClosed,
}

/// Handle for feeding the driver and observing it.
#[derive(Clone)]
pub struct ConsensusHandle {
    msg_tx: mpsc::Sender<MsgInfo>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    event_bus: EventBus,
}

impl ConsensusHandle {
    /// Inject a proposal. `peer_id` is `None` for a locally produced one.
    pub async fn set_proposal(
        &self,
        proposal: Proposal,
        peer_id: Option<PeerId>,
    ) -> Result<(), DriverError> {
        self.send(Message::Proposal(proposal), peer_id).await
    }

    /// Inject one block part.
    pub async fn add_block_part(
        &self,
        height: u64,
        round: i32,
        part: Part,
        peer_id: Option<PeerId>,
    ) -> Result<(), DriverError> {
        self.send(
            Message::BlockPart {
                height,
                round,
                part,
            },
            peer_id,
        )
        .await
    }

    /// Inject a vote.
    pub async fn add_vote(&self, vote: Vote, peer_id: Option<PeerId>) -> Result<(), DriverError> {
        self.send(Message::Vote(vote), peer_id).await
    }

    async fn send(&self, msg: Message, peer_id: Option<PeerId>) -> Result<(), DriverError> {
        // Bounded channel: producers block when the driver falls behind.
        self.msg_tx
            .send(MsgInfo {
                msg,
                peer_id,
                receive_time_ms: now_ms(),
            })
            .await
            .map_err(|_| DriverError::ChannelClosed)
    }

    /// Subscribe to consensus events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ConsensusEvent> {
        self.event_bus.subscribe()
    }

    /// Ask the driver to stop. An in-flight commit is allowed to finish,
    /// bounded by the commit timeout.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

enum Input {
    Msg(MsgInfo),
    Tock(TimeoutInfo),
    TxsAvailable,
    Shutdown,
}

/// The consensus state machine driver.
///
/// Construct with [`Driver::new`] (inside a Tokio runtime), then call
/// [`Driver::run`]. All collaborators are capability interfaces; see
/// [`crate::traits`].
pub struct Driver {
    config: ConsensusConfig,
    /// Chain state up to height − 1
    state: State,
    rs: RoundState,

    block_exec: Arc<dyn BlockExecutor>,
    block_store: Arc<dyn BlockStore>,
    tx_notifier: Arc<dyn TxNotifier>,
    evidence_pool: Arc<dyn EvidencePool>,
    priv_validator: Option<Arc<dyn PrivValidator>>,
    /// Memoized for the duration of one height; keys may rotate
    priv_pub_key: Option<PublicKey>,

    event_bus: EventBus,
    wal: Wal,
    /// Suppresses signing and noisy logs while re-applying WAL records
    replay_mode: bool,

    /// Self-emitted messages, drained before any other input
    self_queue: VecDeque<MsgInfo>,
    msg_rx: mpsc::Receiver<MsgInfo>,
    ticker: TimeoutTicker,
    tock_rx: mpsc::Receiver<TimeoutInfo>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Driver {
    /// Build the driver from its collaborators. Must be called within a
    /// Tokio runtime (the timeout ticker task starts immediately).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConsensusConfig,
        state_store: Arc<dyn StateStore>,
        block_exec: Arc<dyn BlockExecutor>,
        block_store: Arc<dyn BlockStore>,
        tx_notifier: Arc<dyn TxNotifier>,
        evidence_pool: Arc<dyn EvidencePool>,
        priv_validator: Option<Arc<dyn PrivValidator>>,
    ) -> Result<(Self, ConsensusHandle), DriverError> {
        let state = state_store.load()?;
        let wal = Wal::open(&config.wal_file)?;
        let event_bus = EventBus::default();
        let (msg_tx, msg_rx) = mpsc::channel(config.peer_queue_capacity);
        let (ticker, tock_rx) = TimeoutTicker::spawn();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let self_queue = VecDeque::with_capacity(config.internal_queue_capacity);
        let mut driver = Self {
            rs: RoundState::new(&state.chain_id),
            config,
            state: state.clone(),
            block_exec,
            block_store,
            tx_notifier,
            evidence_pool,
            priv_validator,
            priv_pub_key: None,
            event_bus: event_bus.clone(),
            wal,
            replay_mode: false,
            self_queue,
            msg_rx,
            ticker,
            tock_rx,
            shutdown_rx,
        };

        if state.last_block_height > 0 {
            driver.reconstruct_last_commit()?;
        }
        driver.update_to_state(state);

        let handle = ConsensusHandle {
            msg_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            event_bus,
        };
        Ok((driver, handle))
    }

    /// Current height being decided.
    pub fn height(&self) -> u64 {
        self.rs.height
    }

    /// Deterministic snapshot of the round state.
    pub fn round_state_event(&self) -> crate::round_state::RoundStateEvent {
        self.rs.round_state_event()
    }

    /// Replay the WAL, verify signing safety, and run the event loop until
    /// shutdown.
    pub async fn run(mut self) -> Result<(), DriverError> {
        if let Err(e) = self.update_priv_validator_pub_key().await {
            warn!(error = %e, "failed to get private validator pubkey");
        }

        self.catchup_replay().await?;
        self.check_double_signing_risk()?;

        info!(
            height = self.rs.height,
            chain_id = %self.state.chain_id,
            "starting consensus"
        );
        self.schedule_round0();

        loop {
            match self.next_input().await {
                Input::Shutdown => {
                    self.on_shutdown().await;
                    return Ok(());
                }
                input => self.process_input(input).await,
            }
        }
    }

    async fn next_input(&mut self) -> Input {
        // Self-emitted messages are observed only after the originating
        // handler returned, and strictly in emission order.
        if let Some(mi) = self.self_queue.pop_front() {
            return Input::Msg(mi);
        }
        if *self.shutdown_rx.borrow() {
            return Input::Shutdown;
        }
        let notifier = Arc::clone(&self.tx_notifier);
        tokio::select! {
            _ = self.shutdown_rx.changed() => Input::Shutdown,
            maybe = self.msg_rx.recv() => match maybe {
                Some(mi) => Input::Msg(mi),
                None => Input::Shutdown,
            },
            maybe = self.tock_rx.recv() => match maybe {
                Some(ti) => Input::Tock(ti),
                None => Input::Shutdown,
            },
            _ = notifier.txs_available() => Input::TxsAvailable,
        }
    }

    /// Pending inputs only; used to drain an in-flight commit at shutdown.
    async fn next_pending_input(&mut self) -> Option<Input> {
        if let Some(mi) = self.self_queue.pop_front() {
            return Some(Input::Msg(mi));
        }
        tokio::select! {
            maybe = self.msg_rx.recv() => maybe.map(Input::Msg),
            maybe = self.tock_rx.recv() => maybe.map(Input::Tock),
        }
    }

    async fn process_input(&mut self, input: Input) {
        match input {
            Input::Msg(mi) => {
                let internal = mi.is_internal();
                if internal {
                    // The WAL is the equivocation barrier: a self message
                    // that is not durable before dispatch can be re-signed
                    // differently after a restart.
                    if let Err(e) = self.wal.append_sync(&WalMessage::MsgInfo(mi.clone())) {
                        let _ = self.wal.close();
                        panic!("failed to write internal message to consensus wal: {e}");
                    }
                } else if let Err(e) = self.wal.append(&WalMessage::MsgInfo(mi.clone())) {
                    error!(error = %e, "failed writing peer message to wal");
                }
                self.handle_msg(mi, internal).await;
            }
            Input::Tock(ti) => {
                if let Err(e) = self.wal.append(&WalMessage::Timeout(ti.clone())) {
                    error!(error = %e, "failed writing timeout to wal");
                }
                self.handle_timeout(ti).await;
            }
            Input::TxsAvailable => self.handle_txs_available().await,
            Input::Shutdown => unreachable!("shutdown handled by caller"),
        }
    }

    async fn on_shutdown(&mut self) {
        if self.rs.step == Step::Commit {
            info!("shutdown requested during commit; letting it finish");
            let deadline = Instant::now() + self.commit_timeout();
            while self.rs.step == Step::Commit {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    error!("timed out waiting for commit to finish before shutdown");
                    break;
                }
                match tokio::time::timeout(remaining, self.next_pending_input()).await {
                    Ok(Some(input)) => self.process_input(input).await,
                    Ok(None) => break,
                    Err(_) => {
                        error!("timed out waiting for commit to finish before shutdown");
                        break;
                    }
                }
            }
        }
        if let Err(e) = self.wal.close() {
            warn!(error = %e, "error closing wal at shutdown");
        }
        info!("consensus driver stopped");
    }

    //--------------------------------------------------------------------
    // Startup: last-commit reconstruction, WAL replay, double-sign check

    fn reconstruct_last_commit(&mut self) -> Result<(), DriverError> {
        let state = &self.state;
        let height = state.last_block_height;
        let store_err = |msg: String| DriverError::Store(crate::traits::StoreError::Load(msg));

        let vote_set = if state.consensus_params.vote_extensions_enabled(height) {
            let ec = self
                .block_store
                .load_block_extended_commit(height)
                .ok_or_else(|| store_err(format!("extended commit for height {height} not found")))?;
            VoteSet::from_extended_commit(
                state.chain_id.clone(),
                state.last_validators.clone(),
                &ec,
            )
            .map_err(|e| store_err(format!("failed to reconstruct last extended commit: {e}")))?
        } else {
            let commit = match self.block_store.load_seen_commit() {
                Some(c) if c.height == height => c,
                _ => self
                    .block_store
                    .load_block_commit(height)
                    .ok_or_else(|| store_err(format!("commit for height {height} not found")))?,
            };
            VoteSet::from_commit(state.chain_id.clone(), state.last_validators.clone(), &commit)
                .map_err(|e| store_err(format!("failed to reconstruct last commit: {e}")))?
        };

        self.rs.last_commit = Some(vote_set);
        Ok(())
    }

    async fn catchup_replay(&mut self) -> Result<(), DriverError> {
        let mut repair_attempted = false;
        loop {
            match self.replay_wal().await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_data_corruption() => {
                    error!(error = %e, "error on wal catchup replay; starting anyway");
                    return Ok(());
                }
                Err(e) => {
                    if repair_attempted {
                        error!(error = %e, "wal still corrupted after repair");
                        return Err(DriverError::Wal(e));
                    }
                    repair_attempted = true;
                    error!(error = %e, "wal corrupted; attempting repair");

                    let path = self.config.wal_file.clone();
                    let corrupted =
                        std::path::PathBuf::from(format!("{}.CORRUPTED", path.display()));

                    // Back up the damaged file, then rewrite its valid
                    // prefix into a fresh log.
                    self.wal.close().map_err(DriverError::Wal)?;
                    std::fs::copy(&path, &corrupted).map_err(WalError::Io)?;
                    debug!(src = %path.display(), dst = %corrupted.display(), "backed up wal");
                    wal::repair_wal_file(&corrupted, &path)?;
                    info!("successful wal repair");
                    self.wal = Wal::open(&path)?;
                }
            }
        }
    }

    async fn replay_wal(&mut self) -> Result<(), WalError> {
        let records = wal::read_all(&self.config.wal_file)?;
        if records.is_empty() {
            return Ok(());
        }

        let replay_height = self.rs.height;
        let marker = replay_height.saturating_sub(1);
        let tail: Vec<WalMessage> = match wal::records_after_end_height(&records, marker) {
            Some(t) => t.to_vec(),
            None if replay_height <= self.state.initial_height => records,
            None => {
                warn!(
                    height = marker,
                    "no end-height marker found; skipping wal replay"
                );
                return Ok(());
            }
        };

        if tail.is_empty() {
            return Ok(());
        }
        info!(count = tail.len(), height = replay_height, "replaying wal");

        self.replay_mode = true;
        for record in tail {
            match record {
                WalMessage::MsgInfo(mi) => {
                    let internal = mi.is_internal();
                    self.handle_msg(mi, internal).await;
                }
                WalMessage::Timeout(ti) => self.handle_timeout(ti).await,
                WalMessage::RoundState(ev) => {
                    debug!(height = ev.height, round = ev.round, step = %ev.step, "replayed step")
                }
                WalMessage::EndHeight(h) => debug!(height = h, "replayed end-height marker"),
            }
        }
        self.replay_mode = false;
        Ok(())
    }

    fn check_double_signing_risk(&self) -> Result<(), DriverError> {
        let Some(pub_key) = &self.priv_pub_key else {
            return Ok(());
        };
        let lookback = self.config.double_sign_check_height;
        let height = self.rs.height;
        if lookback == 0 || height == 0 {
            return Ok(());
        }
        let address = Address::from_pub_key(pub_key);

        for i in 1..lookback.min(height) {
            let h = height - i;
            let Some(commit) = self.load_commit(h) else {
                continue;
            };
            for sig in &commit.signatures {
                if sig.is_commit() && sig.validator_address == address {
                    info!(height = h, "found signature from our key in recent commit");
                    return Err(DriverError::DoubleSignRisk { height: h });
                }
            }
        }
        Ok(())
    }

    fn load_commit(&self, height: u64) -> Option<Commit> {
        if height == self.block_store.height() {
            if let Some(commit) = self.block_store.load_seen_commit() {
                if commit.height == height {
                    return Some(commit);
                }
            }
        }
        self.block_store.load_block_commit(height)
    }

    //--------------------------------------------------------------------
    // Input handlers

    async fn handle_msg(&mut self, mi: MsgInfo, internal: bool) {
        match mi.msg {
            Message::Proposal(proposal) => {
                if let Err(e) = self.set_proposal(proposal, mi.receive_time_ms) {
                    debug!(error = %e, "rejected proposal");
                }
            }
            Message::BlockPart {
                height,
                round,
                part,
            } => match self.add_proposal_block_part(height, part) {
                Ok(completed) => {
                    if completed {
                        if internal {
                            if let Err(e) = self.wal.flush_sync() {
                                error!(error = %e, "error flushing wal after final block part");
                            }
                        }
                        self.handle_complete_proposal(height).await;
                    }
                }
                Err(e) => {
                    if round != self.rs.round {
                        debug!(
                            height = self.rs.height,
                            cs_round = self.rs.round,
                            part_round = round,
                            "received block part from wrong round"
                        );
                    } else {
                        debug!(error = %e, "error adding block part");
                    }
                }
            },
            Message::Vote(vote) => self.try_add_vote(vote, mi.peer_id).await,
        }
    }

    async fn handle_timeout(&mut self, ti: TimeoutInfo) {
        debug!(timeout = %ti, "received tock");

        // Stale timers are dropped: they are for an earlier round or an
        // earlier step of the current round.
        if ti.height != self.rs.height
            || ti.round < self.rs.round
            || (ti.round == self.rs.round && ti.step < self.rs.step)
        {
            debug!(
                height = self.rs.height,
                round = self.rs.round,
                step = %self.rs.step,
                "ignoring tock because we are ahead"
            );
            return;
        }

        match ti.step {
            Step::NewHeight => self.enter_new_round(ti.height, 0).await,
            Step::NewRound => self.enter_propose(ti.height, ti.round).await,
            Step::Propose => {
                self.event_bus
                    .publish(ConsensusEvent::TimeoutPropose(self.rs.round_state_event()));
                self.enter_prevote(ti.height, ti.round).await;
            }
            Step::PrevoteWait => {
                self.event_bus
                    .publish(ConsensusEvent::TimeoutWait(self.rs.round_state_event()));
                self.enter_precommit(ti.height, ti.round).await;
            }
            Step::PrecommitWait => {
                self.event_bus
                    .publish(ConsensusEvent::TimeoutWait(self.rs.round_state_event()));
                self.enter_precommit(ti.height, ti.round).await;
                self.enter_new_round(ti.height, ti.round + 1).await;
            }
            step => panic!("invalid timeout step: {step}"),
        }
    }

    async fn handle_txs_available(&mut self) {
        // Only meaningful while waiting to propose in round 0.
        if self.rs.round != 0 {
            return;
        }
        match self.rs.step {
            Step::NewHeight => {
                if self.need_proof_block(self.rs.height) {
                    // enter_propose will be called by enter_new_round
                    return;
                }
                // +1ms so the NewRound timeout always lands after NewHeight's.
                let until_start = self
                    .rs
                    .start_time_ms
                    .saturating_sub(now_ms())
                    .saturating_add(1);
                self.schedule_timeout(
                    Duration::from_millis(until_start),
                    self.rs.height,
                    0,
                    Step::NewRound,
                );
            }
            Step::NewRound => self.enter_propose(self.rs.height, 0).await,
            _ => {}
        }
    }

    //--------------------------------------------------------------------
    // Proposals and block parts

    fn set_proposal(&mut self, proposal: Proposal, receive_time_ms: Timestamp) -> Result<(), String> {
        // First proposal wins; identical or competing re-sends are no-ops.
        if self.rs.proposal.is_some() {
            return Ok(());
        }
        if proposal.height != self.rs.height || proposal.round != self.rs.round {
            return Ok(());
        }

        if proposal.pol_round < -1
            || (proposal.pol_round >= 0 && proposal.pol_round >= proposal.round)
        {
            return Err(format!(
                "invalid proposal POL round {} for round {}",
                proposal.pol_round, proposal.round
            ));
        }

        let proposer = self.rs.validators.proposer().clone();
        if !proposal.verify(&self.state.chain_id, &proposer.pub_key) {
            return Err("invalid proposal signature".to_string());
        }

        debug!(proposal = %proposal, "received proposal");
        // Keep an existing part set: it may already be armed for this block
        // id by a polka or a commit.
        if self.rs.proposal_block_parts.is_none() {
            self.rs.proposal_block_parts = Some(PartSet::from_header(
                proposal.block_id.part_set_header.clone(),
            ));
        }
        self.rs.proposal = Some(proposal);
        self.rs.proposal_receive_time_ms = receive_time_ms;
        Ok(())
    }

    /// Returns `Ok(true)` when this part completed the block.
    fn add_proposal_block_part(&mut self, height: u64, part: Part) -> Result<bool, String> {
        if self.rs.height != height {
            debug!(height, "received block part from wrong height");
            return Ok(false);
        }
        let Some(parts) = self.rs.proposal_block_parts.as_mut() else {
            // Happens after a round advance when old parts straggle in.
            debug!(height, index = part.index, "not expecting a block part");
            return Ok(false);
        };

        let added = parts.add_part(part).map_err(|e| e.to_string())?;
        let max_bytes = self.state.consensus_params.block.max_bytes;
        if parts.byte_size() as u64 > max_bytes {
            return Err(format!(
                "total size of proposal block parts exceeds maximum block bytes ({} > {})",
                parts.byte_size(),
                max_bytes
            ));
        }

        if added && parts.is_complete() {
            let block = parts.decode_block().map_err(|e| e.to_string())?;
            info!(
                height = block.header.height,
                hash = %block.hash().short(),
                "received complete proposal block"
            );
            self.rs.proposal_block = Some(block);
            self.event_bus.publish(ConsensusEvent::CompleteProposal(
                self.rs.complete_proposal_event(),
            ));
            return Ok(true);
        }
        Ok(false)
    }

    async fn handle_complete_proposal(&mut self, height: u64) {
        // Adopt the completed block as the valid block if the current round
        // already has a polka for it.
        let round = self.rs.round;
        let polka = self
            .rs
            .votes
            .prevotes(round)
            .and_then(|s| s.two_thirds_majority());
        let has_polka = polka.is_some();
        if let Some(block_id) = polka {
            if !block_id.is_nil()
                && self.rs.valid_round < round
                && self.rs.proposal_block_hashes_to(&block_id.hash)
            {
                debug!(
                    valid_round = round,
                    hash = %block_id.hash.short(),
                    "updating valid block to completed proposal block"
                );
                self.rs.valid_round = round;
                self.rs.valid_block = self.rs.proposal_block.clone();
                self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
            }
        }

        if self.rs.step <= Step::Propose && self.is_proposal_complete() {
            self.enter_prevote(height, round).await;
            if has_polka {
                self.enter_precommit(height, round).await;
            }
        } else if self.rs.step == Step::Commit {
            // We were waiting on this block to finalize.
            self.try_finalize_commit(height).await;
        }
    }

    fn is_proposal_complete(&self) -> bool {
        let Some(proposal) = &self.rs.proposal else {
            return false;
        };
        if self.rs.proposal_block.is_none() {
            return false;
        }
        if proposal.pol_round < 0 {
            return true;
        }
        // A re-proposal must come with the prevotes that justify it.
        self.rs
            .votes
            .prevotes(proposal.pol_round)
            .map(|s| s.two_thirds_majority().is_some())
            .unwrap_or(false)
    }

    //--------------------------------------------------------------------
    // Votes

    async fn try_add_vote(&mut self, vote: Vote, peer_id: Option<PeerId>) {
        match self.add_vote(vote.clone(), &peer_id).await {
            Ok(_added) => {}
            Err(VoteSetError::Conflicting(conflict)) => {
                let my_address = self.my_address();
                if my_address == Some(vote.validator_address) {
                    // Already equivocating; only an external bug (lost WAL,
                    // cloned key) can cause this.
                    error!(
                        height = vote.height,
                        round = vote.round,
                        vote_type = %vote.vote_type,
                        "found conflicting vote from ourselves; did you reset the validator state?"
                    );
                    return;
                }
                self.evidence_pool
                    .report_conflicting_votes(&conflict.existing, &conflict.conflicting);
                debug!(
                    validator = %conflict.existing.validator_address,
                    "sent conflicting votes to the evidence pool"
                );
            }
            Err(e) => {
                info!(error = %e, peer = ?peer_id, "failed attempting to add vote");
            }
        }
    }

    async fn add_vote(
        &mut self,
        mut vote: Vote,
        peer_id: &Option<PeerId>,
    ) -> Result<bool, VoteSetError> {
        debug!(
            vote_height = vote.height,
            vote_type = %vote.vote_type,
            validator_index = vote.validator_index,
            cs_height = self.rs.height,
            "adding vote"
        );

        // A precommit for the previous height arriving while we wait out
        // the commit timeout joins the last commit.
        if vote.height + 1 == self.rs.height && vote.vote_type == VoteType::Precommit {
            if self.rs.step != Step::NewHeight {
                debug!("precommit for previous height arrived too late; ignored");
                return Ok(false);
            }
            let Some(last_commit) = self.rs.last_commit.as_mut() else {
                return Ok(false);
            };
            let added = last_commit.add_vote(vote.clone())?;
            if !added {
                return Ok(false);
            }
            debug!("added vote to last commit");
            self.event_bus.publish(ConsensusEvent::Vote(vote));

            let all_in = self
                .rs
                .last_commit
                .as_ref()
                .map(|lc| lc.has_all())
                .unwrap_or(false);
            if self.bypass_commit_timeout() && all_in {
                self.enter_new_round(self.rs.height, 0).await;
            }
            return Ok(true);
        }

        // Height mismatch is ignored; not necessarily a bad peer.
        if vote.height != self.rs.height {
            debug!(
                vote_height = vote.height,
                cs_height = self.rs.height,
                peer = ?peer_id,
                "vote ignored and not added"
            );
            return Ok(false);
        }

        if self
            .state
            .consensus_params
            .vote_extensions_enabled(self.rs.height)
        {
            // Peers' non-nil precommits must carry a verifiable extension.
            let is_foreign = self.my_address() != Some(vote.validator_address);
            if vote.vote_type == VoteType::Precommit && !vote.block_id.is_nil() && is_foreign {
                let validator = self
                    .rs
                    .validators
                    .get_by_index(vote.validator_index)
                    .ok_or(VoteSetError::InvalidValidatorIndex {
                        index: vote.validator_index,
                        size: self.rs.validators.len(),
                    })?;
                if !vote.verify_extension(&self.state.chain_id, &validator.pub_key) {
                    return Err(VoteSetError::MissingExtension(vote.validator_address));
                }
                if let Err(e) = self.block_exec.verify_vote_extension(&vote).await {
                    info!(error = %e, "application rejected vote extension");
                    return Err(VoteSetError::MissingExtension(vote.validator_address));
                }
            }
        } else if vote.strip_extension() {
            error!(peer = ?peer_id, "vote included extension data but extensions are disabled");
        }

        let added = self.rs.votes.add_vote(vote.clone(), peer_id.as_ref())?;
        if !added {
            return Ok(false);
        }
        self.event_bus.publish(ConsensusEvent::Vote(vote.clone()));

        let height = self.rs.height;
        match vote.vote_type {
            VoteType::Prevote => self.on_prevote_added(height, &vote).await,
            VoteType::Precommit => self.on_precommit_added(height, &vote).await,
        }
        Ok(true)
    }

    async fn on_prevote_added(&mut self, height: u64, vote: &Vote) {
        let round = vote.round;
        let (maj23, two_thirds_any) = {
            let prevotes = self.rs.votes.prevotes(round).expect("set exists after add");
            (prevotes.two_thirds_majority(), prevotes.two_thirds_any())
        };

        // A non-nil polka at the current round makes that block the valid
        // block, even if we cannot prevote it ourselves.
        if let Some(block_id) = &maj23 {
            if !block_id.is_nil() && self.rs.valid_round < round && round == self.rs.round {
                if self.rs.proposal_block_hashes_to(&block_id.hash) {
                    debug!(
                        pol_round = round,
                        hash = %block_id.hash.short(),
                        "updating valid block because of polka"
                    );
                    self.rs.valid_round = round;
                    self.rs.valid_block = self.rs.proposal_block.clone();
                    self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
                } else {
                    debug!(
                        hash = %block_id.hash.short(),
                        "polka for a block we do not have; clearing proposal block"
                    );
                    self.rs.proposal_block = None;
                }
                let has_header = self
                    .rs
                    .proposal_block_parts
                    .as_ref()
                    .map(|p| p.has_header(&block_id.part_set_header))
                    .unwrap_or(false);
                if !has_header {
                    self.rs.proposal_block_parts =
                        Some(PartSet::from_header(block_id.part_set_header.clone()));
                }
                self.event_bus
                    .publish(ConsensusEvent::ValidBlock(self.rs.round_state_event()));
            }
        }

        if self.rs.round < round && two_thirds_any {
            // Round skip: +2/3 of anything in a later round.
            self.enter_new_round(height, round).await;
        } else if self.rs.round == round && Step::Prevote <= self.rs.step {
            if let Some(block_id) = &maj23 {
                if self.is_proposal_complete() || block_id.is_nil() {
                    self.enter_precommit(height, round).await;
                    return;
                }
            }
            if two_thirds_any {
                self.enter_prevote_wait(height, round).await;
            }
        } else {
            // The prevotes may have completed the POL the proposal claims.
            let pol_round = self.rs.proposal.as_ref().map(|p| p.pol_round);
            if pol_round == Some(round) && round >= 0 && self.is_proposal_complete() {
                let current_round = self.rs.round;
                self.enter_prevote(height, current_round).await;
            }
        }
    }

    async fn on_precommit_added(&mut self, height: u64, vote: &Vote) {
        let round = vote.round;
        let (maj23, two_thirds_any, has_all) = {
            let precommits = self
                .rs
                .votes
                .precommits(round)
                .expect("set exists after add");
            (
                precommits.two_thirds_majority(),
                precommits.two_thirds_any(),
                precommits.has_all(),
            )
        };

        if let Some(block_id) = maj23 {
            self.enter_new_round(height, round).await;
            self.enter_precommit(height, round).await;

            if !block_id.is_nil() {
                self.enter_commit(height, round).await;
                if self.bypass_commit_timeout() && has_all {
                    let next_height = self.rs.height;
                    self.enter_new_round(next_height, 0).await;
                }
            } else {
                self.enter_precommit_wait(height, round).await;
            }
        } else if self.rs.round <= round && two_thirds_any {
            self.enter_new_round(height, round).await;
            self.enter_precommit_wait(height, round).await;
        }
    }

    //--------------------------------------------------------------------
    // Step entries

    async fn enter_new_round(&mut self, height: u64, round: i32) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step != Step::NewHeight)
        {
            debug!(
                height,
                round,
                current = %format_args!("{}/{}/{}", self.rs.height, self.rs.round, self.rs.step),
                "entering new round with invalid args"
            );
            return;
        }

        if self.rs.start_time_ms > now_ms() {
            debug!("entering new round before round start time");
        }
        debug!(height, round, "entering new round");

        // Advance the proposer rotation by however many rounds we skipped.
        if self.rs.round < round {
            let increment = round - self.rs.round;
            let mut validators = self.rs.validators.clone();
            validators.increment_proposer_priority(increment);
            self.rs.validators = validators;
        }

        self.rs.round = round;
        self.rs.step = Step::NewRound;
        if round == 0 {
            // Proposal fields were already reset at NewHeight, and a round-0
            // proposal may have arrived during the commit wait.
        } else {
            debug!("resetting proposal info");
            self.rs.proposal = None;
            self.rs.proposal_receive_time_ms = 0;
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = None;
        }

        // Track the next round too, so votes there can trigger a skip.
        self.rs.votes.set_round(round + 1);
        self.rs.triggered_timeout_precommit = false;

        self.event_bus
            .publish(ConsensusEvent::NewRound(self.rs.new_round_event()));

        // In round 0 we may hold off proposing until txs show up, unless a
        // proof block is due.
        let wait_for_txs =
            self.config.wait_for_txs() && round == 0 && !self.need_proof_block(height);
        if wait_for_txs {
            let interval = self.config.create_empty_blocks_interval_ms;
            if interval > 0 {
                self.schedule_timeout(
                    Duration::from_millis(interval),
                    height,
                    round,
                    Step::NewRound,
                );
            }
            return;
        }
        self.enter_propose(height, round).await;
    }

    /// True on the initial height and whenever the last block changed the
    /// app hash, so the new app hash gets signed right away.
    fn need_proof_block(&self, height: u64) -> bool {
        if height == self.state.initial_height {
            return true;
        }
        let Some(last_meta) = self.block_store.load_block_meta(height - 1) else {
            panic!("need_proof_block: last block meta for height {} not found", height - 1);
        };
        self.state.app_hash != last_meta.header.app_hash
    }

    async fn enter_propose(&mut self, height: u64, round: i32) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && Step::Propose <= self.rs.step)
        {
            debug!(
                height,
                round,
                current = %format_args!("{}/{}/{}", self.rs.height, self.rs.round, self.rs.step),
                "entering propose step with invalid args"
            );
            return;
        }

        // Block times must increase monotonically; a proposer whose clock
        // trails the previous block time waits out the difference.
        if let Some(address) = self.my_address() {
            if self.is_proposer(&address) {
                let wait_ms = self.state.last_block_time_ms.saturating_sub(now_ms());
                if wait_ms > 0 {
                    self.schedule_timeout(
                        Duration::from_millis(wait_ms),
                        height,
                        round,
                        Step::NewRound,
                    );
                    return;
                }
            }
        }

        debug!(height, round, "entering propose step");

        // If the proposal doesn't arrive in time we prevote nil.
        self.schedule_timeout(self.propose_timeout(round), height, round, Step::Propose);

        match self.my_address() {
            None => debug!("not proposing: node is not a validator"),
            Some(address) if !self.rs.validators.has_address(&address) => {
                debug!(%address, "not proposing: not in the validator set");
            }
            Some(address) => {
                if self.is_proposer(&address) {
                    debug!(proposer = %address, "our turn to propose");
                    self.decide_proposal(height, round).await;
                } else {
                    debug!(
                        proposer = %self.rs.validators.proposer().address,
                        "not our turn to propose"
                    );
                }
            }
        }

        self.rs.round = round;
        self.rs.step = Step::Propose;
        self.new_step();

        if self.is_proposal_complete() {
            let current_round = self.rs.round;
            self.enter_prevote(height, current_round).await;
        }
    }

    fn is_proposer(&self, address: &Address) -> bool {
        &self.rs.validators.proposer().address == address
    }

    async fn decide_proposal(&mut self, height: u64, round: i32) {
        if self.replay_mode {
            return;
        }
        let Some(priv_validator) = self.priv_validator.clone() else {
            return;
        };
        let Some(address) = self.my_address() else {
            error!("propose step: empty private validator public key");
            return;
        };

        let (block, parts) = if let (Some(block), Some(parts)) =
            (self.rs.valid_block.clone(), self.rs.valid_block_parts.clone())
        {
            debug!(height, round, "re-proposing valid block");
            (block, parts)
        } else {
            let Some(block) = self.create_proposal_block(address).await else {
                return;
            };
            let parts = PartSet::from_block(&block);
            (block, parts)
        };

        // Flush the WAL first. Otherwise we may not recompute the same
        // proposal on restart, and the signer will refuse to re-sign.
        if let Err(e) = self.wal.flush_sync() {
            error!(error = %e, "failed flushing wal before signing proposal");
        }

        let block_id = BlockId::new(block.hash(), parts.header().clone());
        let mut proposal = Proposal::new(
            height,
            round,
            self.rs.valid_round,
            block_id,
            block.header.time_ms,
            address,
        );

        let sign_deadline = self.propose_timeout(round);
        let chain_id = self.state.chain_id.clone();
        let signed = tokio::time::timeout(
            sign_deadline,
            priv_validator.sign_proposal(&chain_id, &mut proposal),
        )
        .await;

        match signed {
            Ok(Ok(())) => {
                self.send_internal(Message::Proposal(proposal));
                for index in 0..parts.total() {
                    let part = parts.get_part(index).expect("built part set is complete");
                    self.send_internal(Message::BlockPart {
                        height,
                        round,
                        part: part.clone(),
                    });
                }
                debug!(height, round, "signed proposal");
            }
            Ok(Err(e)) => error!(height, round, error = %e, "failed signing proposal"),
            Err(_) => error!(height, round, "timed out signing proposal"),
        }
    }

    async fn create_proposal_block(&mut self, proposer: Address) -> Option<kestrel_types::Block> {
        let last_extended_commit = if self.rs.height == self.state.initial_height {
            // Proposing the first block: the commit is empty but not absent.
            ExtendedCommit::empty()
        } else if let Some(commit) = self
            .rs
            .last_commit
            .as_ref()
            .filter(|lc| lc.two_thirds_majority().is_some())
            .and_then(|lc| lc.make_extended_commit())
        {
            commit
        } else {
            error!("propose step: cannot propose without commit for the previous block");
            return None;
        };

        let deadline = self.propose_timeout(self.rs.round);
        match tokio::time::timeout(
            deadline,
            self.block_exec.create_proposal_block(
                self.rs.height,
                &self.state,
                &last_extended_commit,
                proposer,
            ),
        )
        .await
        {
            Ok(Ok(block)) => Some(block),
            Ok(Err(e)) => {
                error!(error = %e, "unable to create proposal block");
                None
            }
            Err(_) => {
                error!("timed out creating proposal block");
                None
            }
        }
    }

    async fn enter_prevote(&mut self, height: u64, round: i32) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && Step::Prevote <= self.rs.step)
        {
            debug!(
                height,
                round,
                current = %format_args!("{}/{}/{}", self.rs.height, self.rs.round, self.rs.step),
                "entering prevote step with invalid args"
            );
            return;
        }

        debug!(height, round, "entering prevote step");
        self.do_prevote(height, round).await;

        self.rs.round = round;
        self.rs.step = Step::Prevote;
        self.new_step();
        // Once any +2/3 prevotes arrive we move to PrevoteWait.
    }

    async fn do_prevote(&mut self, height: u64, round: i32) {
        if self.rs.proposal.is_none() {
            info!(height, round, "prevote step: no proposal; prevoting nil");
            self.sign_add_vote(VoteType::Prevote, None).await;
            return;
        }
        if self.rs.proposal_block.is_none() {
            info!(height, round, "prevote step: block not complete; prevoting nil");
            self.sign_add_vote(VoteType::Prevote, None).await;
            return;
        }

        let proposal = self.rs.proposal.clone().expect("checked above");
        let block = self.rs.proposal_block.clone().expect("checked above");

        if proposal.timestamp_ms != block.header.time_ms {
            info!(
                height,
                round,
                "prevote step: proposal timestamp differs from block time; prevoting nil"
            );
            self.sign_add_vote(VoteType::Prevote, None).await;
            return;
        }

        // Proposer-based timestamps: a fresh proposal must land inside the
        // synchrony window unless we are already locked.
        if proposal.pol_round == -1 && self.rs.locked_round == -1 && !self.proposal_is_timely() {
            let sp = &self.state.consensus_params.synchrony;
            info!(
                height,
                round,
                proposed_ms = proposal.timestamp_ms,
                received_ms = self.rs.proposal_receive_time_ms,
                message_delay_ms = sp.message_delay_ms,
                precision_ms = sp.precision_ms,
                "prevote step: proposal is not timely; prevoting nil"
            );
            self.sign_add_vote(VoteType::Prevote, None).await;
            return;
        }

        let deadline = self.vote_timeout(round);
        match tokio::time::timeout(deadline, self.block_exec.validate_block(&self.state, &block))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(height, round, error = %e, "prevote step: invalid block; prevoting nil");
                self.sign_add_vote(VoteType::Prevote, None).await;
                return;
            }
            Err(_) => {
                error!(height, round, "prevote step: block validation timed out; prevoting nil");
                self.sign_add_vote(VoteType::Prevote, None).await;
                return;
            }
        }

        let accepted = match tokio::time::timeout(
            deadline,
            self.block_exec.process_proposal(&block, &self.state),
        )
        .await
        {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => panic!("process_proposal: {e}"),
            Err(_) => {
                error!(height, round, "prevote step: process_proposal timed out; prevoting nil");
                self.sign_add_vote(VoteType::Prevote, None).await;
                return;
            }
        };
        if !accepted {
            error!(
                height,
                round,
                proposer = %proposal.proposer_address,
                "prevote step: application rejected the proposed block; prevoting nil"
            );
            self.sign_add_vote(VoteType::Prevote, None).await;
            return;
        }

        let block_hash = block.hash();
        let parts_header = self
            .rs
            .proposal_block_parts
            .as_ref()
            .expect("block complete implies parts present")
            .header()
            .clone();

        // A fresh proposal is voteable when we are unlocked or it matches
        // our lock.
        if proposal.pol_round == -1 {
            if self.rs.locked_round == -1 {
                info!(height, round, "prevote step: no locked block; prevoting the proposal");
                self.sign_add_vote(VoteType::Prevote, Some((block_hash, parts_header)))
                    .await;
                return;
            }
            if self.rs.locked_block_hashes_to(&block_hash) {
                info!(height, round, "prevote step: proposal matches our lock; prevoting it");
                self.sign_add_vote(VoteType::Prevote, Some((block_hash, parts_header)))
                    .await;
                return;
            }
        }

        // A re-proposal is voteable when its POL round really has a polka
        // for it, and that polka is at or after our locked round (or the
        // block is our lock anyway).
        if proposal.pol_round >= 0 && proposal.pol_round < round {
            let pol_block_id = self
                .rs
                .votes
                .prevotes(proposal.pol_round)
                .and_then(|s| s.two_thirds_majority());
            if let Some(block_id) = pol_block_id {
                if block.hashes_to(&block_id.hash) {
                    if self.rs.locked_round <= proposal.pol_round {
                        info!(
                            height,
                            round,
                            "prevote step: proposal has a polka after our locked round; prevoting it"
                        );
                        self.sign_add_vote(VoteType::Prevote, Some((block_hash, parts_header)))
                            .await;
                        return;
                    }
                    if self.rs.locked_block_hashes_to(&block_hash) {
                        info!(height, round, "prevote step: proposal matches our lock; prevoting it");
                        self.sign_add_vote(VoteType::Prevote, Some((block_hash, parts_header)))
                            .await;
                        return;
                    }
                }
            }
        }

        info!(
            height,
            round,
            "prevote step: block valid but not our lock and no later polka; prevoting nil"
        );
        self.sign_add_vote(VoteType::Prevote, None).await;
    }

    fn proposal_is_timely(&self) -> bool {
        let Some(proposal) = &self.rs.proposal else {
            return false;
        };
        proposal.is_timely(
            self.rs.proposal_receive_time_ms,
            &self.state.consensus_params.synchrony,
            self.rs.round,
        )
    }

    async fn enter_prevote_wait(&mut self, height: u64, round: i32) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && Step::PrevoteWait <= self.rs.step)
        {
            debug!(
                height,
                round,
                current = %format_args!("{}/{}/{}", self.rs.height, self.rs.round, self.rs.step),
                "entering prevote wait step with invalid args"
            );
            return;
        }
        let any = self
            .rs
            .votes
            .prevotes(round)
            .map(|s| s.two_thirds_any())
            .unwrap_or(false);
        if !any {
            panic!("entering prevote wait step ({height}/{round}) without +2/3 prevotes for anything");
        }

        debug!(height, round, "entering prevote wait step");
        self.schedule_timeout(self.vote_timeout(round), height, round, Step::PrevoteWait);

        self.rs.round = round;
        self.rs.step = Step::PrevoteWait;
        self.new_step();
    }

    async fn enter_precommit(&mut self, height: u64, round: i32) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && Step::Precommit <= self.rs.step)
        {
            debug!(
                height,
                round,
                current = %format_args!("{}/{}/{}", self.rs.height, self.rs.round, self.rs.step),
                "entering precommit step with invalid args"
            );
            return;
        }

        debug!(height, round, "entering precommit step");

        let maj23 = self
            .rs
            .votes
            .prevotes(round)
            .and_then(|s| s.two_thirds_majority());

        match maj23 {
            None => {
                if self.rs.locked_block.is_some() {
                    info!(height, round, "precommit step: no polka while locked; precommitting nil");
                } else {
                    info!(height, round, "precommit step: no polka; precommitting nil");
                }
                self.sign_add_vote(VoteType::Precommit, None).await;
            }
            Some(block_id) => {
                self.event_bus
                    .publish(ConsensusEvent::Polka(self.rs.round_state_event()));

                // The freshest POL must be this round's.
                if let Some((pol_round, _)) = self.rs.votes.pol_info() {
                    if pol_round < round {
                        panic!("POL round should be {round} but got {pol_round}");
                    }
                }

                if block_id.is_nil() {
                    info!(height, round, "precommit step: +2/3 prevoted nil; precommitting nil");
                    self.sign_add_vote(VoteType::Precommit, None).await;
                } else if self.rs.locked_block_hashes_to(&block_id.hash) {
                    // Re-lock on the block we were already locked to.
                    info!(height, round, "precommit step: +2/3 prevoted our locked block; relocking");
                    self.rs.locked_round = round;
                    self.event_bus
                        .publish(ConsensusEvent::Relock(self.rs.round_state_event()));
                    self.sign_add_vote(
                        VoteType::Precommit,
                        Some((block_id.hash, block_id.part_set_header)),
                    )
                    .await;
                } else if self.rs.proposal_block_hashes_to(&block_id.hash) {
                    info!(
                        height,
                        round,
                        hash = %block_id.hash.short(),
                        "precommit step: +2/3 prevoted proposal block; locking"
                    );
                    let block = self.rs.proposal_block.clone().expect("hash matched");
                    if let Err(e) = self.block_exec.validate_block(&self.state, &block).await {
                        panic!("precommit step: +2/3 prevoted an invalid block: {e}");
                    }
                    self.rs.locked_round = round;
                    self.rs.locked_block = Some(block);
                    self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
                    self.event_bus
                        .publish(ConsensusEvent::Lock(self.rs.round_state_event()));
                    self.sign_add_vote(
                        VoteType::Precommit,
                        Some((block_id.hash, block_id.part_set_header)),
                    )
                    .await;
                } else {
                    // Polka for a block we don't have: start fetching it by
                    // its part-set header and precommit nil.
                    info!(
                        height,
                        round,
                        hash = %block_id.hash.short(),
                        "precommit step: +2/3 prevoted a block we do not have; precommitting nil"
                    );
                    let has_header = self
                        .rs
                        .proposal_block_parts
                        .as_ref()
                        .map(|p| p.has_header(&block_id.part_set_header))
                        .unwrap_or(false);
                    if !has_header {
                        self.rs.proposal_block = None;
                        self.rs.proposal_block_parts =
                            Some(PartSet::from_header(block_id.part_set_header.clone()));
                    }
                    self.sign_add_vote(VoteType::Precommit, None).await;
                }
            }
        }

        self.rs.round = round;
        self.rs.step = Step::Precommit;
        self.new_step();
    }

    async fn enter_precommit_wait(&mut self, height: u64, round: i32) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.triggered_timeout_precommit)
        {
            debug!(
                height,
                round,
                triggered = self.rs.triggered_timeout_precommit,
                "entering precommit wait step with invalid args"
            );
            return;
        }
        let any = self
            .rs
            .votes
            .precommits(round)
            .map(|s| s.two_thirds_any())
            .unwrap_or(false);
        if !any {
            panic!(
                "entering precommit wait step ({height}/{round}) without +2/3 precommits for anything"
            );
        }

        debug!(height, round, "entering precommit wait step");
        self.schedule_timeout(self.vote_timeout(round), height, round, Step::PrecommitWait);

        self.rs.triggered_timeout_precommit = true;
        self.new_step();
    }

    async fn enter_commit(&mut self, height: u64, commit_round: i32) {
        if self.rs.height != height || Step::Commit <= self.rs.step {
            debug!(
                height,
                commit_round,
                current = %format_args!("{}/{}/{}", self.rs.height, self.rs.round, self.rs.step),
                "entering commit step with invalid args"
            );
            return;
        }

        debug!(height, commit_round, "entering commit step");

        let block_id = self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(|s| s.two_thirds_majority())
            .expect("enter_commit requires +2/3 precommits");

        // The locked block no longer matters; adopt it as the proposal
        // block if it is the one being committed.
        if self.rs.locked_block_hashes_to(&block_id.hash) {
            info!(hash = %block_id.hash.short(), "commit is for our locked block");
            self.rs.proposal_block = self.rs.locked_block.clone();
            self.rs.proposal_block_parts = self.rs.locked_block_parts.clone();
        }

        // If we don't have the committed block yet, arm the part set and
        // wait for it.
        if !self.rs.proposal_block_hashes_to(&block_id.hash) {
            let has_header = self
                .rs
                .proposal_block_parts
                .as_ref()
                .map(|p| p.has_header(&block_id.part_set_header))
                .unwrap_or(false);
            if !has_header {
                info!(
                    commit = %block_id.hash.short(),
                    "commit is for a block we do not know about; fetching"
                );
                self.rs.proposal_block = None;
                self.rs.proposal_block_parts =
                    Some(PartSet::from_header(block_id.part_set_header.clone()));
                self.event_bus
                    .publish(ConsensusEvent::ValidBlock(self.rs.round_state_event()));
            }
        }

        self.rs.step = Step::Commit;
        self.rs.commit_round = commit_round;
        self.rs.commit_time_ms = now_ms();
        self.new_step();

        self.try_finalize_commit(height).await;
    }

    async fn try_finalize_commit(&mut self, height: u64) {
        if self.rs.height != height {
            panic!(
                "try_finalize_commit: height mismatch {} vs {height}",
                self.rs.height
            );
        }

        let block_id = self
            .rs
            .votes
            .precommits(self.rs.commit_round)
            .and_then(|s| s.two_thirds_majority());
        let Some(block_id) = block_id.filter(|id| !id.is_nil()) else {
            error!("failed to finalize commit: no +2/3 precommit majority for a block");
            return;
        };
        if !self.rs.proposal_block_hashes_to(&block_id.hash) {
            info!(
                commit = %block_id.hash.short(),
                "cannot finalize commit yet: we do not have the committed block"
            );
            return;
        }

        self.finalize_commit(height).await;
    }

    async fn finalize_commit(&mut self, height: u64) {
        if self.rs.height != height || self.rs.step != Step::Commit {
            debug!(
                height,
                current = %format_args!("{}/{}/{}", self.rs.height, self.rs.round, self.rs.step),
                "finalize commit called outside commit step"
            );
            return;
        }

        let block_id = self
            .rs
            .votes
            .precommits(self.rs.commit_round)
            .and_then(|s| s.two_thirds_majority())
            .expect("finalize_commit requires +2/3 precommits");
        let block = self.rs.proposal_block.clone().expect("block present");
        let parts = self.rs.proposal_block_parts.clone().expect("parts present");

        if !parts.has_header(&block_id.part_set_header) {
            panic!("finalize_commit: proposal parts header does not match commit header");
        }
        if !block.hashes_to(&block_id.hash) {
            panic!("finalize_commit: proposal block does not hash to commit hash");
        }
        if let Err(e) = self.block_exec.validate_block(&self.state, &block).await {
            panic!("+2/3 committed an invalid block: {e}");
        }

        info!(
            height,
            hash = %block.hash().short(),
            num_txs = block.data.len(),
            "finalizing commit of block"
        );

        if self.block_store.height() < block.header.height {
            // The seen commit is our local justification; the next block
            // may embed a different-but-equivalent commit.
            let seen_extended_commit = self
                .rs
                .votes
                .precommits(self.rs.commit_round)
                .and_then(|s| s.make_extended_commit())
                .expect("majority implies commit");
            if self
                .state
                .consensus_params
                .vote_extensions_enabled(block.header.height)
            {
                self.block_store
                    .save_block_with_extended_commit(&block, &parts, &seen_extended_commit);
            } else {
                self.block_store
                    .save_block(&block, &parts, &seen_extended_commit.to_commit());
            }
        } else {
            // Replay after a crash that saved the block but not the marker.
            debug!(height, "block already stored; skipping save");
        }

        // The end-height marker asserts the block store has the block; it
        // must be durable before we move on.
        if let Err(e) = self.wal.append_sync(&WalMessage::EndHeight(height)) {
            let _ = self.wal.close();
            panic!("failed to write end-height marker to consensus wal: {e}");
        }

        let state_copy = self.state.clone();
        match self
            .block_exec
            .apply_block(state_copy, &block_id, &block)
            .await
        {
            Ok(new_state) => {
                self.update_to_state(new_state);
                // Keys may rotate between heights.
                if let Err(e) = self.update_priv_validator_pub_key().await {
                    error!(error = %e, "failed to refresh private validator pubkey");
                }
                self.schedule_round0();
            }
            Err(e) => {
                // Do not advance; a retry can follow when the commit is
                // observed again.
                error!(error = %e, "failed to apply block");
            }
        }
    }

    //--------------------------------------------------------------------
    // Height rotation

    fn update_to_state(&mut self, state: State) {
        if self.rs.commit_round > -1
            && self.rs.height > 0
            && self.rs.height != state.last_block_height
        {
            panic!(
                "update_to_state expected state height {} but got {}",
                self.rs.height, state.last_block_height
            );
        }

        if state.last_block_height == 0 {
            // The very first commit is empty.
            self.rs.last_commit = None;
        } else if self.rs.commit_round > -1 {
            let precommits = self
                .rs
                .votes
                .precommits(self.rs.commit_round)
                .cloned();
            match precommits {
                Some(p) if p.two_thirds_majority().is_some() => {
                    self.rs.last_commit = Some(p);
                }
                _ => panic!(
                    "wanted to form a commit, but precommits ({}/{}) lack a +2/3 majority",
                    state.last_block_height, self.rs.commit_round
                ),
            }
        } else if self.rs.last_commit.is_none() {
            // On a restart last_commit is reconstructed from the stores
            // before the first update_to_state.
            panic!(
                "last commit cannot be empty after initial block (height {})",
                state.last_block_height + 1
            );
        }

        let height = state.next_height();
        let commit_timeout = self.commit_timeout().as_millis() as u64;

        self.rs.height = height;
        self.rs.round = 0;
        self.rs.step = Step::NewHeight;
        self.rs.start_time_ms = if self.rs.commit_time_ms == 0 {
            // Fresh start: give the first block the commit-wait too, so
            // transactions can accumulate.
            now_ms() + commit_timeout
        } else {
            self.rs.commit_time_ms + commit_timeout
        };
        self.rs.validators = state.validators.clone();
        self.rs.proposal = None;
        self.rs.proposal_receive_time_ms = 0;
        self.rs.proposal_block = None;
        self.rs.proposal_block_parts = None;
        self.rs.locked_round = -1;
        self.rs.locked_block = None;
        self.rs.locked_block_parts = None;
        self.rs.valid_round = -1;
        self.rs.valid_block = None;
        self.rs.valid_block_parts = None;
        self.rs.votes = HeightVoteSet::new(
            state.chain_id.clone(),
            height,
            state.validators.clone(),
            state.consensus_params.vote_extensions_enabled(height),
        );
        self.rs.commit_round = -1;
        self.rs.last_validators = state.last_validators.clone();
        self.rs.triggered_timeout_precommit = false;

        self.state = state;
        self.new_step();
    }

    fn schedule_round0(&mut self) {
        let sleep_ms = self.rs.start_time_ms.saturating_sub(now_ms());
        self.schedule_timeout(
            Duration::from_millis(sleep_ms),
            self.rs.height,
            0,
            Step::NewHeight,
        );
    }

    //--------------------------------------------------------------------
    // Signing

    async fn sign_add_vote(
        &mut self,
        vote_type: VoteType,
        block: Option<(kestrel_types::H256, PartSetHeader)>,
    ) {
        if self.replay_mode {
            // Replay must never emit a second signature for a decision the
            // pre-crash process already made.
            return;
        }
        let Some(priv_validator) = self.priv_validator.clone() else {
            return;
        };
        let Some(address) = self.my_address() else {
            error!("sign_add_vote: private validator public key is not set");
            return;
        };
        if !self.rs.validators.has_address(&address) {
            return;
        }

        match self.sign_vote(priv_validator, address, vote_type, block).await {
            Ok(mut vote) => {
                if !self
                    .state
                    .consensus_params
                    .vote_extensions_enabled(vote.height)
                {
                    // The signer may attach extension data regardless;
                    // never let it out when extensions are disabled.
                    vote.strip_extension();
                }
                info!(
                    height = vote.height,
                    round = vote.round,
                    vote_type = %vote.vote_type,
                    block = %vote.block_id.hash.short(),
                    "signed and pushed vote"
                );
                self.send_internal(Message::Vote(vote));
            }
            Err(e) => {
                // Abandon this vote; the round will time out and retry on
                // the next one.
                error!(
                    height = self.rs.height,
                    round = self.rs.round,
                    error = %e,
                    "failed signing vote"
                );
            }
        }
    }

    async fn sign_vote(
        &mut self,
        priv_validator: Arc<dyn PrivValidator>,
        address: Address,
        vote_type: VoteType,
        block: Option<(kestrel_types::H256, PartSetHeader)>,
    ) -> Result<Vote, String> {
        // The WAL must contain everything that justifies this signature
        // before the signer can release it.
        self.wal.flush_sync().map_err(|e| e.to_string())?;

        let (index, _) = self
            .rs
            .validators
            .get_by_address(&address)
            .ok_or_else(|| "validator address not in set".to_string())?;
        let block_id = match block {
            Some((hash, header)) => BlockId::new(hash, header),
            None => BlockId::nil(),
        };

        let mut vote = Vote::new(
            vote_type,
            self.rs.height,
            self.rs.round,
            block_id,
            now_ms(),
            address,
            index,
        );

        let mut sign_deadline = Duration::from_secs(1);
        if vote_type == VoteType::Precommit && !vote.block_id.is_nil() {
            sign_deadline = self.vote_timeout(self.rs.round);
            if self
                .state
                .consensus_params
                .vote_extensions_enabled(self.rs.height)
            {
                vote.extension = self
                    .block_exec
                    .extend_vote(&vote)
                    .await
                    .map_err(|e| e.to_string())?;
            }
        }

        let chain_id = self.state.chain_id.clone();
        match tokio::time::timeout(
            sign_deadline,
            priv_validator.sign_vote(&chain_id, &mut vote),
        )
        .await
        {
            Ok(Ok(())) => Ok(vote),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("timed out waiting for signer".to_string()),
        }
    }

    async fn update_priv_validator_pub_key(&mut self) -> Result<(), String> {
        let Some(priv_validator) = self.priv_validator.clone() else {
            return Ok(());
        };
        let deadline = self.vote_timeout(self.rs.round);
        let pub_key = tokio::time::timeout(deadline, priv_validator.get_pub_key())
            .await
            .map_err(|_| "timed out fetching pubkey".to_string())?
            .map_err(|e| e.to_string())?;
        self.priv_pub_key = Some(pub_key);
        Ok(())
    }

    fn my_address(&self) -> Option<Address> {
        self.priv_pub_key.as_ref().map(Address::from_pub_key)
    }

    fn send_internal(&mut self, msg: Message) {
        self.self_queue.push_back(MsgInfo {
            msg,
            peer_id: None,
            receive_time_ms: now_ms(),
        });
    }

    //--------------------------------------------------------------------
    // Step bookkeeping and timeouts

    /// Record the step change in the WAL and announce it.
    fn new_step(&mut self) {
        let event = self.rs.round_state_event();
        if let Err(e) = self.wal.append(&WalMessage::RoundState(event.clone())) {
            error!(error = %e, "failed writing round state to wal");
        }
        self.event_bus.publish(ConsensusEvent::NewRoundStep(event));
    }

    fn schedule_timeout(&self, duration: Duration, height: u64, round: i32, step: Step) {
        self.ticker.schedule(TimeoutInfo {
            duration_ms: duration.as_millis() as u64,
            height,
            round,
            step,
        });
    }

    fn propose_timeout(&self, round: i32) -> Duration {
        let tp = &self.state.consensus_params.timeout;
        let base = if self.config.unsafe_propose_timeout_override_ms != 0 {
            self.config.unsafe_propose_timeout_override_ms
        } else {
            tp.propose_ms
        };
        let delta = if self.config.unsafe_propose_timeout_delta_override_ms != 0 {
            self.config.unsafe_propose_timeout_delta_override_ms
        } else {
            tp.propose_delta_ms
        };
        Duration::from_millis(base.saturating_add(delta.saturating_mul(round.max(0) as u64)))
    }

    fn vote_timeout(&self, round: i32) -> Duration {
        let tp = &self.state.consensus_params.timeout;
        let base = if self.config.unsafe_vote_timeout_override_ms != 0 {
            self.config.unsafe_vote_timeout_override_ms
        } else {
            tp.vote_ms
        };
        let delta = if self.config.unsafe_vote_timeout_delta_override_ms != 0 {
            self.config.unsafe_vote_timeout_delta_override_ms
        } else {
            tp.vote_delta_ms
        };
        Duration::from_millis(base.saturating_add(delta.saturating_mul(round.max(0) as u64)))
    }

    fn commit_timeout(&self) -> Duration {
        let ms = if self.config.unsafe_commit_timeout_override_ms != 0 {
            self.config.unsafe_commit_timeout_override_ms
        } else {
            self.state.consensus_params.timeout.commit_ms
        };
        Duration::from_millis(ms)
    }

    fn bypass_commit_timeout(&self) -> bool {
        self.config
            .unsafe_bypass_commit_timeout_override
            .unwrap_or(self.state.consensus_params.timeout.bypass_commit_timeout)
    }
}
