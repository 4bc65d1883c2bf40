//! SFU Manager - Top-level orchestration for multi-room SFU management
//!
//! This module provides:
//! - Room creation on the least loaded media worker
//! - Room limit enforcement
//! - Eviction of rooms that stayed empty for `idle_timeout_ms`

use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::SfuConfig;
use crate::engine::MediaWorker;
use crate::error::{Result, SfuError};
use crate::inspector::Inspector;
use crate::room::SfuRoom;
use crate::signaling::Connection;
use crate::types::{PeerId, RoomId};

/// SFU Manager - manages multiple rooms and provides top-level orchestration
pub struct SfuManager {
    /// Configuration
    config: Arc<SfuConfig>,

    /// Media engine workers rooms are spread over
    workers: Vec<Arc<dyn MediaWorker>>,

    /// Active rooms (uses DashMap for lock-free concurrent access)
    rooms: DashMap<RoomId, Arc<SfuRoom>>,

    /// Rooms report here when their idle timer fires
    idle_tx: mpsc::UnboundedSender<RoomId>,
}

impl SfuManager {
    /// Create a new SFU manager over an injected worker pool
    pub fn new(config: SfuConfig, workers: Vec<Arc<dyn MediaWorker>>) -> Arc<Self> {
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            config: Arc::new(config),
            workers,
            rooms: DashMap::new(),
            idle_tx,
        });

        info!(
            workers = manager.workers.len(),
            max_rooms = manager.config.max_rooms,
            max_peers_per_room = manager.config.max_peers_per_room,
            idle_timeout_ms = manager.config.idle_timeout_ms,
            inspector = manager.config.inspector.enabled,
            "SFU Manager initialized"
        );

        tokio::spawn(idle_reaper(Arc::downgrade(&manager), idle_rx));

        manager
    }

    /// Create a room on the least loaded worker and return its id
    pub async fn create_room(&self, app_data: Value) -> Result<RoomId> {
        // Enforce room limit (0 = unlimited)
        if self.config.max_rooms > 0 && self.rooms.len() >= self.config.max_rooms {
            warn!(
                current_rooms = self.rooms.len(),
                max_rooms = self.config.max_rooms,
                "Room limit reached"
            );
            return Err(SfuError::RoomFull(
                "maximum number of rooms reached".to_string(),
            ));
        }

        let worker = self.select_worker().await?;
        let router = worker
            .create_router(&self.config.router.router_options())
            .await?;

        let inspector = self.config.inspector.enabled.then(|| {
            Inspector::new(
                self.config.inspector.clone(),
                &self.config.router,
                Arc::clone(&router),
            )
        });

        let room_id = RoomId::generate();
        let room = SfuRoom::new(
            room_id.clone(),
            app_data,
            router,
            Arc::clone(&self.config),
            inspector,
            self.idle_tx.clone(),
        );
        self.rooms.insert(room_id.clone(), Arc::clone(&room));
        room.load();

        info!(
            room_id = %room_id,
            worker_id = %worker.id(),
            total_rooms = self.rooms.len(),
            "Created new room"
        );

        Ok(room_id)
    }

    /// Join `room_id` with a new signaling connection
    pub async fn join_room(&self, connection: Connection, room_id: &RoomId) -> Result<PeerId> {
        let room = self
            .room(room_id)
            .ok_or_else(|| SfuError::NotFound(format!("room {room_id}")))?;
        room.add_peer(connection).await
    }

    /// Remove and close a room
    pub async fn delete_room(&self, room_id: &RoomId) -> Result<()> {
        let (_, room) = self
            .rooms
            .remove(room_id)
            .ok_or_else(|| SfuError::NotFound(format!("room {room_id}")))?;
        room.close().await;

        info!(
            room_id = %room_id,
            remaining_rooms = self.rooms.len(),
            "Deleted room"
        );
        Ok(())
    }

    /// Application data the room was created with
    pub fn room_app_data(&self, room_id: &RoomId) -> Result<Value> {
        self.room(room_id)
            .map(|room| room.app_data().clone())
            .ok_or_else(|| SfuError::NotFound(format!("room {room_id}")))
    }

    #[must_use]
    pub fn room(&self, room_id: &RoomId) -> Option<Arc<SfuRoom>> {
        self.rooms
            .get(room_id)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|room| !room.is_closed())
    }

    /// Get configuration
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    /// Get list of all active room IDs
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Get number of active rooms
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Close every room
    pub async fn shutdown(&self) {
        let rooms: Vec<_> = self
            .room_ids()
            .into_iter()
            .filter_map(|id| self.rooms.remove(&id).map(|(_, room)| room))
            .collect();
        let count = rooms.len();

        join_all(rooms.iter().map(|room| room.close())).await;
        info!(rooms = count, "SFU Manager shut down");
    }

    /// Worker with the least cumulative user CPU time. Workers whose usage
    /// cannot be read are skipped.
    async fn select_worker(&self) -> Result<Arc<dyn MediaWorker>> {
        let usages = join_all(self.workers.iter().map(|worker| worker.resource_usage())).await;

        let mut best: Option<(u64, &Arc<dyn MediaWorker>)> = None;
        for (worker, usage) in self.workers.iter().zip(usages) {
            match usage {
                Ok(usage) => {
                    debug!(worker_id = %worker.id(), ru_utime = usage.ru_utime, "Worker load");
                    if best.is_none_or(|(utime, _)| usage.ru_utime < utime) {
                        best = Some((usage.ru_utime, worker));
                    }
                }
                Err(e) => {
                    warn!(worker_id = %worker.id(), error = %e, "Failed to read worker usage, skipping");
                }
            }
        }

        best.map(|(_, worker)| Arc::clone(worker)).ok_or_else(|| {
            error!(workers = self.workers.len(), "No media worker available");
            SfuError::Engine("no media worker available".to_string())
        })
    }

    /// Close a room whose idle timer fired, unless someone joined meanwhile
    async fn evict_idle(&self, room_id: &RoomId) {
        let Some(room) = self.rooms.get(room_id).map(|entry| Arc::clone(entry.value())) else {
            return;
        };

        if room.close_if_idle().await {
            self.rooms
                .remove_if(room_id, |_, current| Arc::ptr_eq(current, &room));
            info!(
                room_id = %room_id,
                remaining_rooms = self.rooms.len(),
                "Evicted idle room"
            );
        } else {
            debug!(room_id = %room_id, "Room is no longer idle");
        }
    }
}

/// Background task evicting rooms reported idle
async fn idle_reaper(manager: Weak<SfuManager>, mut idle_rx: mpsc::UnboundedReceiver<RoomId>) {
    while let Some(room_id) = idle_rx.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.evict_idle(&room_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{self, FakeWorker};
    use crate::signaling::ServerEvent;
    use serde_json::json;
    use std::time::Duration;

    fn manager_with(config: SfuConfig, workers: &[Arc<FakeWorker>]) -> Arc<SfuManager> {
        let workers = workers
            .iter()
            .map(|w| Arc::clone(w) as Arc<dyn MediaWorker>)
            .collect();
        SfuManager::new(config, workers)
    }

    #[tokio::test]
    async fn test_manager_creation() {
        let manager = manager_with(SfuConfig::default(), &[FakeWorker::new("w1", 0)]);
        assert_eq!(manager.room_count(), 0);
    }

    #[tokio::test]
    async fn test_least_loaded_worker_is_chosen() {
        let busy = FakeWorker::new("busy", 900);
        let idle = FakeWorker::new("idle", 100);
        let broken = FakeWorker::new("broken", 0);
        broken.set_failing(true);
        let manager = manager_with(
            SfuConfig::default(),
            &[Arc::clone(&busy), Arc::clone(&idle), Arc::clone(&broken)],
        );

        manager.create_room(json!({})).await.unwrap();
        assert_eq!(idle.routers().len(), 1);
        assert!(busy.routers().is_empty());
        assert!(broken.routers().is_empty());

        idle.set_utime(2_000);
        manager.create_room(json!({})).await.unwrap();
        assert_eq!(busy.routers().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_pool_fails() {
        let manager = manager_with(SfuConfig::default(), &[]);
        let err = manager.create_room(json!({})).await.unwrap_err();
        assert!(matches!(err, SfuError::Engine(_)));

        let broken = FakeWorker::new("broken", 0);
        broken.set_failing(true);
        let manager = manager_with(SfuConfig::default(), &[broken]);
        assert!(manager.create_room(json!({})).await.is_err());
        assert_eq!(manager.room_count(), 0);
    }

    #[tokio::test]
    async fn test_room_limit() {
        let config = SfuConfig {
            max_rooms: 2,
            ..SfuConfig::default()
        };
        let manager = manager_with(config, &[FakeWorker::new("w1", 0)]);

        // Create rooms up to limit
        manager.create_room(json!({})).await.unwrap();
        manager.create_room(json!({})).await.unwrap();

        // Creating one more should fail
        let err = manager.create_room(json!({})).await.unwrap_err();
        assert!(matches!(err, SfuError::RoomFull(_)));
    }

    #[tokio::test]
    async fn test_room_lifecycle() {
        let manager = manager_with(SfuConfig::default(), &[FakeWorker::new("w1", 0)]);

        let room_id = manager
            .create_room(json!({ "title": "retro" }))
            .await
            .unwrap();
        assert_eq!(manager.room_count(), 1);
        assert_eq!(manager.room_ids(), vec![room_id.clone()]);
        assert_eq!(manager.room_app_data(&room_id).unwrap(), json!({ "title": "retro" }));

        let (connection, mut client) = mock::connection();
        let peer_id = manager.join_room(connection, &room_id).await.unwrap();
        let init = client.expect_event(ServerEvent::Initialize).await;
        assert_eq!(init["id"], json!(peer_id));
        assert_eq!(init["appData"]["title"], "retro");

        manager.delete_room(&room_id).await.unwrap();
        assert!(client.is_disconnected());
        assert_eq!(manager.room_count(), 0);

        assert!(matches!(
            manager.delete_room(&room_id).await.unwrap_err(),
            SfuError::NotFound(_)
        ));
        assert!(matches!(
            manager.room_app_data(&room_id).unwrap_err(),
            SfuError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_join_missing_room() {
        let manager = manager_with(SfuConfig::default(), &[FakeWorker::new("w1", 0)]);
        let (connection, _client) = mock::connection();
        let err = manager
            .join_room(connection, &RoomId::from("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_peer_limit() {
        let config = SfuConfig {
            max_peers_per_room: 2,
            ..SfuConfig::default()
        };
        let manager = manager_with(config, &[FakeWorker::new("w1", 0)]);
        let room_id = manager.create_room(json!({})).await.unwrap();

        // Add peers up to limit
        let (first, _c1) = mock::connection();
        let (second, _c2) = mock::connection();
        manager.join_room(first, &room_id).await.unwrap();
        manager.join_room(second, &room_id).await.unwrap();

        // Adding one more should fail
        let (third, _c3) = mock::connection();
        let err = manager.join_room(third, &room_id).await.unwrap_err();
        assert!(matches!(err, SfuError::RoomFull(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_room_is_evicted() {
        let worker = FakeWorker::new("w1", 0);
        let manager = manager_with(SfuConfig::default(), &[Arc::clone(&worker)]);
        let room_id = manager.create_room(json!({})).await.unwrap();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(manager.room_count(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.room_count(), 0);
        assert!(manager.room(&room_id).is_none());
        assert!(worker.routers()[0].is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_occupied_room_is_kept() {
        let manager = manager_with(SfuConfig::default(), &[FakeWorker::new("w1", 0)]);
        let room_id = manager.create_room(json!({})).await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        let (connection, client) = mock::connection();
        manager.join_room(connection, &room_id).await.unwrap();

        // the timer was cleared by the join
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(manager.room_count(), 1);

        // leaving re-arms it for a full period
        client.disconnect();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(manager.room_count(), 1);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(manager.room_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_rooms() {
        let worker = FakeWorker::new("w1", 0);
        let manager = manager_with(SfuConfig::default(), &[Arc::clone(&worker)]);
        manager.create_room(json!({})).await.unwrap();
        manager.create_room(json!({})).await.unwrap();

        manager.shutdown().await;
        assert_eq!(manager.room_count(), 0);
        assert!(worker.routers().iter().all(|r| r.is_closed()));
    }
}
