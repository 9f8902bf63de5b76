//! Shard runtime.
//!
//! Every held space runs in its own tokio task that owns its [`SpaceSynchronizer`] and
//! processes [`SpaceCommand`]s one at a time, replying over oneshot channels. The
//! [`Shard`] routes requests by character location, drives the periodic tick
//! (offline pruning, chat GC, invariant checks) and writes dirty entities through the
//! [`SaveScheduler`].

use log::{debug, error, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::engine::assets::AssetCatalog;
use crate::engine::character::{Character, CharacterBundle};
use crate::engine::directory::{DirectoryUpdate, ReconcilePlan, ShardRegistration};
use crate::engine::errors::EngineError;
use crate::engine::protocol::{ClientRequest, ServerMessage, ServerResponse};
use crate::engine::save_queue::{EntityLocks, SaveKey, SaveScheduler};
use crate::engine::space::{JoinRejected, SpaceBundle, SpaceSettings, SpaceSynchronizer};
use crate::engine::storage::ShardStore;
use crate::engine::types::{CharacterId, CharacterState, SpaceConfig, SpaceId};
use crate::metrics;

/// Wall clock in unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSettings {
    pub id: String,
    pub offline_timeout_ms: i64,
    pub save_debounce_ms: u64,
    pub save_max_wait_ms: u64,
    pub tick_ms: u64,
    pub space: SpaceSettings,
}

impl Default for ShardSettings {
    fn default() -> Self {
        Self {
            id: "shard-1".to_string(),
            offline_timeout_ms: 5 * 60 * 1000,
            save_debounce_ms: 2_000,
            save_max_wait_ms: 30_000,
            tick_ms: 1_000,
            space: SpaceSettings::default(),
        }
    }
}

/// Entity state handed over for writing.
#[derive(Debug, Clone)]
pub enum SaveRecord {
    Character(CharacterBundle),
    Space(SpaceBundle),
}

impl SaveRecord {
    pub fn key(&self) -> SaveKey {
        match self {
            SaveRecord::Character(bundle) => SaveKey::Character(bundle.id.clone()),
            SaveRecord::Space(bundle) => SaveKey::Space(bundle.id.clone()),
        }
    }
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub dirty: Vec<SaveKey>,
    pub pruned: Vec<CharacterBundle>,
    pub chat_removed: usize,
    pub fatal: Option<String>,
}

#[derive(Debug)]
pub struct ShutdownReport {
    pub space: SpaceBundle,
    pub characters: Vec<CharacterBundle>,
}

/// Work for a space worker. Every command carries the time it was issued at.
pub enum SpaceCommand {
    Join {
        character: Box<Character>,
        appearance: CharacterState,
        now: i64,
        reply: oneshot::Sender<Result<(), JoinRejected>>,
    },
    /// Remove a character and hand back the live value
    Take {
        character: CharacterId,
        now: i64,
        reply: oneshot::Sender<Option<(Box<Character>, CharacterState)>>,
    },
    Leave {
        character: CharacterId,
        now: i64,
        reply: oneshot::Sender<Option<CharacterBundle>>,
    },
    Connect {
        character: CharacterId,
        sender: mpsc::UnboundedSender<ServerMessage>,
        now: i64,
        reply: oneshot::Sender<bool>,
    },
    Disconnect {
        character: CharacterId,
        now: i64,
    },
    Request {
        character: CharacterId,
        request: ClientRequest,
        now: i64,
        reply: oneshot::Sender<ServerResponse>,
    },
    Notice {
        character: CharacterId,
        text: String,
        now: i64,
    },
    Tick {
        now: i64,
        offline_timeout_ms: i64,
        reply: oneshot::Sender<TickReport>,
    },
    Collect {
        keys: Vec<SaveKey>,
        reply: oneshot::Sender<Vec<SaveRecord>>,
    },
    Shutdown {
        now: i64,
        reply: oneshot::Sender<ShutdownReport>,
    },
}

async fn run_space(mut sync: SpaceSynchronizer, mut rx: mpsc::UnboundedReceiver<SpaceCommand>) {
    let id = sync.id().clone();
    debug!("space worker {} started", id);
    while let Some(command) = rx.recv().await {
        match command {
            SpaceCommand::Join {
                character,
                appearance,
                now,
                reply,
            } => {
                let _ = reply.send(sync.join(*character, appearance, now));
            }
            SpaceCommand::Take { character, now, reply } => {
                let taken = sync
                    .take_character(&character, now)
                    .map(|(character, appearance)| (Box::new(character), appearance));
                let _ = reply.send(taken);
            }
            SpaceCommand::Leave { character, now, reply } => {
                let _ = reply.send(sync.leave(&character, now));
            }
            SpaceCommand::Connect {
                character,
                sender,
                now,
                reply,
            } => {
                let _ = reply.send(sync.connect(&character, sender, now));
            }
            SpaceCommand::Disconnect { character, now } => sync.disconnect(&character, now),
            SpaceCommand::Request {
                character,
                request,
                now,
                reply,
            } => {
                let _ = reply.send(sync.handle_request(&character, request, now));
            }
            SpaceCommand::Notice { character, text, now } => sync.notify(&character, &text, now),
            SpaceCommand::Tick {
                now,
                offline_timeout_ms,
                reply,
            } => {
                let pruned = sync.prune_offline(now, offline_timeout_ms);
                let chat_removed = sync.gc_chat(now);
                let fatal = sync.check_invariants().err().map(|err| err.to_string());
                let _ = reply.send(TickReport {
                    dirty: sync.take_dirty(),
                    pruned,
                    chat_removed,
                    fatal,
                });
            }
            SpaceCommand::Collect { keys, reply } => {
                let records = keys
                    .iter()
                    .filter_map(|key| match key {
                        SaveKey::Character(id) => sync.character_bundle(id).map(SaveRecord::Character),
                        SaveKey::Space(space) if space == sync.id() => Some(SaveRecord::Space(sync.to_bundle())),
                        SaveKey::Space(_) => None,
                    })
                    .collect();
                let _ = reply.send(records);
            }
            SpaceCommand::Shutdown { now, reply } => {
                let ids: Vec<CharacterId> = sync.characters().ids().cloned().collect();
                let characters = ids.iter().filter_map(|id| sync.leave(id, now)).collect();
                let _ = reply.send(ShutdownReport {
                    space: sync.to_bundle(),
                    characters,
                });
                break;
            }
        }
    }
    debug!("space worker {} stopped", id);
}

struct SpaceHandle {
    tx: mpsc::UnboundedSender<SpaceCommand>,
    task: JoinHandle<()>,
}

pub struct Shard {
    settings: ShardSettings,
    store: ShardStore,
    assets: Arc<AssetCatalog>,
    spaces: BTreeMap<SpaceId, SpaceHandle>,
    locations: BTreeMap<CharacterId, SpaceId>,
    scheduler: SaveScheduler,
    locks: EntityLocks,
    /// Records of unloaded entities whose final write failed
    retry: BTreeMap<SaveKey, SaveRecord>,
    fatal: Option<String>,
}

impl Shard {
    pub fn new(settings: ShardSettings, store: ShardStore, assets: Arc<AssetCatalog>) -> Self {
        let scheduler = SaveScheduler::new(settings.save_debounce_ms, settings.save_max_wait_ms);
        Self {
            settings,
            store,
            assets,
            spaces: BTreeMap::new(),
            locations: BTreeMap::new(),
            scheduler,
            locks: EntityLocks::new(),
            retry: BTreeMap::new(),
            fatal: None,
        }
    }

    pub fn store(&self) -> &ShardStore {
        &self.store
    }

    pub fn space_ids(&self) -> BTreeSet<SpaceId> {
        self.spaces.keys().cloned().collect()
    }

    pub fn character_ids(&self) -> BTreeSet<CharacterId> {
        self.locations.keys().cloned().collect()
    }

    pub fn location(&self, character: &CharacterId) -> Option<&SpaceId> {
        self.locations.get(character)
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    pub fn pending_saves(&self) -> usize {
        self.scheduler.len() + self.retry.len()
    }

    pub fn registration(&self) -> ShardRegistration {
        ShardRegistration {
            shard: self.settings.id.clone(),
            characters: self.locations.keys().cloned().collect(),
            spaces: self.spaces.keys().cloned().collect(),
        }
    }

    async fn call<T>(
        &self,
        space: &SpaceId,
        build: impl FnOnce(oneshot::Sender<T>) -> SpaceCommand,
    ) -> Result<T, EngineError> {
        let handle = self
            .spaces
            .get(space)
            .ok_or_else(|| EngineError::SpaceUnavailable(space.to_string()))?;
        let (tx, rx) = oneshot::channel();
        handle
            .tx
            .send(build(tx))
            .map_err(|_| EngineError::SpaceUnavailable(space.to_string()))?;
        rx.await
            .map_err(|_| EngineError::SpaceUnavailable(space.to_string()))
    }

    fn send(&self, space: &SpaceId, command: SpaceCommand) -> Result<(), EngineError> {
        let handle = self
            .spaces
            .get(space)
            .ok_or_else(|| EngineError::SpaceUnavailable(space.to_string()))?;
        handle
            .tx
            .send(command)
            .map_err(|_| EngineError::SpaceUnavailable(space.to_string()))
    }

    fn locate(&self, character: &CharacterId) -> Result<SpaceId, EngineError> {
        self.locations
            .get(character)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("character: {}", character)))
    }

    // ------------------------------------------------------------------
    // Spaces
    // ------------------------------------------------------------------

    /// Store a new empty space and start serving it.
    pub async fn create_space(&mut self, id: SpaceId, config: SpaceConfig) -> Result<(), EngineError> {
        match self.store.get_space(&id) {
            Ok(_) => return Err(EngineError::Conflict(format!("space {} already exists", id))),
            Err(EngineError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        self.store.put_space(SpaceBundle::new(id.clone(), config))?;
        self.open_space(&id)
    }

    /// Load a stored space and spawn its worker. No-op when already held.
    pub fn open_space(&mut self, id: &SpaceId) -> Result<(), EngineError> {
        if self.spaces.contains_key(id) {
            return Ok(());
        }
        let bundle = self.store.get_space(id)?;
        let sync = SpaceSynchronizer::from_bundle(self.assets.clone(), bundle, self.settings.space)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_space(sync, rx));
        self.spaces.insert(id.clone(), SpaceHandle { tx, task });
        info!("opened space {}", id);
        Ok(())
    }

    /// Stop a space worker after saving it and every character in it.
    pub async fn close_space(&mut self, id: &SpaceId, now: i64) -> Result<(), EngineError> {
        let report = self.call(id, |reply| SpaceCommand::Shutdown { now, reply }).await?;
        for bundle in report.characters {
            self.locations.remove(&bundle.id);
            self.scheduler.forget(&SaveKey::Character(bundle.id.clone()));
            self.persist(SaveRecord::Character(bundle)).await;
        }
        self.scheduler.forget(&SaveKey::Space(id.clone()));
        self.persist(SaveRecord::Space(report.space)).await;
        if let Some(handle) = self.spaces.remove(id) {
            if let Err(err) = handle.task.await {
                warn!("space worker {} ended abnormally: {}", id, err);
            }
        }
        info!("closed space {}", id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Characters
    // ------------------------------------------------------------------

    /// Load a stored character into the space its appearance points at.
    pub async fn load_character(&mut self, id: &CharacterId, now: i64) -> Result<(), EngineError> {
        if self.locations.contains_key(id) {
            return Ok(());
        }
        let bundle = self.store.get_character(id)?;
        let space = bundle.appearance.space.clone();
        if !self.spaces.contains_key(&space) {
            return Err(EngineError::SpaceUnavailable(space.to_string()));
        }
        let (character, appearance) = Character::from_bundle(bundle, self.settings.space.limits, now);
        self.call(&space, |reply| SpaceCommand::Join {
            character: Box::new(character),
            appearance,
            now,
            reply,
        })
        .await?
        .map_err(|rejected| rejected.error)?;
        self.locations.insert(id.clone(), space);
        Ok(())
    }

    /// Remove a character from its space and write its final state.
    pub async fn unload_character(&mut self, id: &CharacterId, now: i64) -> Result<(), EngineError> {
        let space = self.locate(id)?;
        let bundle = self
            .call(&space, |reply| SpaceCommand::Leave {
                character: id.clone(),
                now,
                reply,
            })
            .await?;
        self.locations.remove(id);
        self.scheduler.forget(&SaveKey::Character(id.clone()));
        if let Some(bundle) = bundle {
            self.persist(SaveRecord::Character(bundle)).await;
        }
        Ok(())
    }

    /// Move a live character to another held space. On rejection the character
    /// goes back where it was.
    pub async fn move_character(&mut self, id: &CharacterId, to: &SpaceId, now: i64) -> Result<(), EngineError> {
        let from = self.locate(id)?;
        if &from == to {
            return Ok(());
        }
        if !self.spaces.contains_key(to) {
            return Err(EngineError::SpaceUnavailable(to.to_string()));
        }
        let Some((character, appearance)) = self
            .call(&from, |reply| SpaceCommand::Take {
                character: id.clone(),
                now,
                reply,
            })
            .await?
        else {
            return Err(EngineError::NotFound(format!("character: {}", id)));
        };
        let joined = self
            .call(to, |reply| SpaceCommand::Join {
                character,
                appearance,
                now,
                reply,
            })
            .await?;
        match joined {
            Ok(()) => {
                self.locations.insert(id.clone(), to.clone());
                self.scheduler.mark_dirty(SaveKey::Character(id.clone()), now);
                info!("moved {} from {} to {}", id, from, to);
                Ok(())
            }
            Err(rejected) => {
                warn!("{} could not join {}: {}", id, to, rejected.error);
                let restored = self
                    .call(&from, |reply| SpaceCommand::Join {
                        character: rejected.character,
                        appearance: rejected.appearance,
                        now,
                        reply,
                    })
                    .await?;
                if restored.is_err() {
                    self.locations.remove(id);
                    return Err(EngineError::FatalInvariant(format!("{} lost while moving", id)));
                }
                Err(rejected.error)
            }
        }
    }

    pub async fn connect(
        &self,
        id: &CharacterId,
        sender: mpsc::UnboundedSender<ServerMessage>,
        now: i64,
    ) -> Result<bool, EngineError> {
        let space = self.locate(id)?;
        self.call(&space, |reply| SpaceCommand::Connect {
            character: id.clone(),
            sender,
            now,
            reply,
        })
        .await
    }

    pub fn disconnect(&self, id: &CharacterId, now: i64) -> Result<(), EngineError> {
        let space = self.locate(id)?;
        self.send(
            &space,
            SpaceCommand::Disconnect {
                character: id.clone(),
                now,
            },
        )
    }

    /// Route a client request to the space holding `id`.
    pub async fn handle(&self, id: &CharacterId, request: ClientRequest, now: i64) -> Result<ServerResponse, EngineError> {
        let Some(space) = self.locations.get(id) else {
            return Ok(ServerResponse::UnknownCharacter);
        };
        self.call(space, |reply| SpaceCommand::Request {
            character: id.clone(),
            request,
            now,
            reply,
        })
        .await
    }

    // ------------------------------------------------------------------
    // Directory
    // ------------------------------------------------------------------

    /// Bring held spaces and characters in line with a directory update. Individual
    /// failures are logged and skipped.
    pub async fn reconcile(&mut self, update: &DirectoryUpdate, now: i64) -> ReconcilePlan {
        let plan = ReconcilePlan::compute(&self.character_ids(), &self.space_ids(), update);
        for id in &plan.load_spaces {
            if let Err(err) = self.open_space(id) {
                warn!("failed to open space {}: {}", id, err);
            }
        }
        for id in &plan.unload_characters {
            if let Err(err) = self.unload_character(id, now).await {
                warn!("failed to unload {}: {}", id, err);
            }
        }
        for id in &plan.load_characters {
            if let Err(err) = self.load_character(id, now).await {
                warn!("failed to load {}: {}", id, err);
            }
        }
        for id in &plan.unload_spaces {
            if let Err(err) = self.close_space(id, now).await {
                warn!("failed to close space {}: {}", id, err);
            }
        }
        for message in update.messages.iter().flatten() {
            if let Some(space) = self.locations.get(&message.to) {
                let notice = SpaceCommand::Notice {
                    character: message.to.clone(),
                    text: message.text.clone(),
                    now,
                };
                if let Err(err) = self.send(space, notice) {
                    debug!("notice for {} dropped: {}", message.to, err);
                }
            }
        }
        if !plan.is_empty() {
            info!(
                "reconciled: +{} / -{} spaces, +{} / -{} characters",
                plan.load_spaces.len(),
                plan.unload_spaces.len(),
                plan.load_characters.len(),
                plan.unload_characters.len()
            );
        }
        plan
    }

    // ------------------------------------------------------------------
    // Timers and persistence
    // ------------------------------------------------------------------

    /// Housekeeping pass over every space, then write whatever is due. Returns a
    /// fatal error when any space reports a broken invariant.
    pub async fn tick(&mut self, now: i64) -> Result<(), EngineError> {
        let offline_timeout_ms = self.settings.offline_timeout_ms;
        let ids: Vec<SpaceId> = self.spaces.keys().cloned().collect();
        for id in ids {
            let report = match self
                .call(&id, |reply| SpaceCommand::Tick {
                    now,
                    offline_timeout_ms,
                    reply,
                })
                .await
            {
                Ok(report) => report,
                Err(err) => {
                    warn!("tick skipped for {}: {}", id, err);
                    continue;
                }
            };
            for key in report.dirty {
                self.scheduler.mark_dirty(key, now);
            }
            for bundle in report.pruned {
                info!("unloaded offline character {}", bundle.id);
                self.locations.remove(&bundle.id);
                self.scheduler.forget(&SaveKey::Character(bundle.id.clone()));
                self.persist(SaveRecord::Character(bundle)).await;
            }
            if report.chat_removed > 0 {
                debug!("space {}: dropped {} old chat entries", id, report.chat_removed);
            }
            if let Some(reason) = report.fatal {
                error!("space {} failed its invariant check: {}", id, reason);
                self.fatal = Some(reason.clone());
                return Err(EngineError::FatalInvariant(reason));
            }
        }
        self.flush(now, false).await;
        Ok(())
    }

    /// Write due entities (all dirty ones when `force`). Failures are re-queued.
    pub async fn flush(&mut self, now: i64, force: bool) -> usize {
        let mut written = 0;
        let retry = std::mem::take(&mut self.retry);
        for (_, record) in retry {
            if self.persist(record).await {
                written += 1;
            }
        }

        let keys = if force {
            self.scheduler.drain_all()
        } else {
            self.scheduler.due(now)
        };
        if keys.is_empty() {
            return written;
        }
        let mut by_space: BTreeMap<SpaceId, Vec<SaveKey>> = BTreeMap::new();
        for key in keys {
            let space = match &key {
                SaveKey::Character(id) => self.locations.get(id).cloned(),
                SaveKey::Space(id) => self.spaces.contains_key(id).then(|| id.clone()),
            };
            match space {
                Some(space) => by_space.entry(space).or_default().push(key),
                // Unloaded since it was marked; its final state was written then.
                None => self.scheduler.complete(&key),
            }
        }
        for (space, keys) in by_space {
            let requested = keys.clone();
            let records = match self.call(&space, |reply| SpaceCommand::Collect { keys, reply }).await {
                Ok(records) => records,
                Err(err) => {
                    warn!("could not collect saves from {}: {}", space, err);
                    for key in requested {
                        self.scheduler.requeue(key, now);
                    }
                    continue;
                }
            };
            let collected: BTreeSet<SaveKey> = records.iter().map(SaveRecord::key).collect();
            for key in requested.iter().filter(|key| !collected.contains(*key)) {
                self.scheduler.complete(key);
            }
            for record in records {
                let key = record.key();
                if self.write(&record).await {
                    self.scheduler.complete(&key);
                    written += 1;
                } else {
                    self.scheduler.requeue(key, now);
                }
            }
        }
        written
    }

    async fn write(&self, record: &SaveRecord) -> bool {
        let key = record.key();
        let _guard = self.locks.acquire(&key).await;
        let result = match record {
            SaveRecord::Character(bundle) => self.store.put_character(bundle.clone()),
            SaveRecord::Space(bundle) => self.store.put_space(bundle.clone()),
        };
        match result {
            Ok(()) => {
                metrics::inc_saves_completed();
                debug!("saved {}", key);
                true
            }
            Err(err) => {
                metrics::inc_saves_failed();
                warn!("failed to save {}: {}", key, err);
                false
            }
        }
    }

    /// Write a record of an entity that is no longer held; keep it for retry on failure.
    async fn persist(&mut self, record: SaveRecord) -> bool {
        if self.write(&record).await {
            return true;
        }
        self.retry.insert(record.key(), record);
        false
    }

    /// Save and stop everything.
    pub async fn shutdown(&mut self, now: i64) -> Result<(), EngineError> {
        self.flush(now, true).await;
        let ids: Vec<SpaceId> = self.spaces.keys().cloned().collect();
        for id in ids {
            if let Err(err) = self.close_space(&id, now).await {
                warn!("failed to close space {}: {}", id, err);
            }
        }
        self.locks.prune();
        if !self.retry.is_empty() {
            error!("{} entities could not be saved before shutdown", self.retry.len());
        }
        self.store.flush()?;
        info!("shard {} stopped", self.settings.id);
        Ok(())
    }

    /// Run the tick loop until Ctrl-C or a fatal invariant, then shut down.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        let mut interval = tokio::time::interval(Duration::from_millis(self.settings.tick_ms.max(10)));
        info!(
            "shard {} running with {} spaces and {} characters",
            self.settings.id,
            self.spaces.len(),
            self.locations.len()
        );
        let outcome = loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.tick(now_ms()).await {
                        if err.is_fatal() {
                            break Err(err);
                        }
                        warn!("tick failed: {}", err);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break Ok(());
                }
            }
        };
        self.shutdown(now_ms()).await?;
        outcome
    }
}
