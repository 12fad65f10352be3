use crate::config::TradingSettings;
use crate::exchange::SharedExchange;
use crate::models::OrderPlaced;
use crate::strategy::StrategyConfig;
use crate::trading::{TradingEngine, TradingStatus};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::info;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub strategy: StrategyConfig,
    pub trading: TradingSettings,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: Uuid,
    pub strategy: String,
    pub symbols: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub orders_placed: usize,
    pub status: TradingStatus,
}

struct Session {
    id: Uuid,
    strategy: String,
    symbols: Vec<String>,
    started_at: DateTime<Utc>,
    stopped_at: Mutex<Option<DateTime<Utc>>>,
    orders_placed: Arc<AtomicUsize>,
    engine: TradingEngine,
}

impl Session {
    fn info(&self) -> Result<SessionInfo> {
        let stopped_at = *self
            .stopped_at
            .lock()
            .map_err(|_| anyhow!("session {} state is poisoned", self.id))?;
        Ok(SessionInfo {
            id: self.id,
            strategy: self.strategy.clone(),
            symbols: self.symbols.clone(),
            started_at: self.started_at,
            stopped_at,
            orders_placed: self.orders_placed.load(Ordering::SeqCst),
            status: self.engine.status()?,
        })
    }
}

/// Registry of live trading sessions, each backed by its own trading engine.
pub struct SessionManager {
    exchange: SharedExchange,
    sessions: DashMap<Uuid, Arc<Session>>,
}

impl SessionManager {
    pub fn new(exchange: SharedExchange) -> Self {
        Self {
            exchange,
            sessions: DashMap::new(),
        }
    }

    /// Builds the strategy, starts an engine for it and returns the new session id.
    pub fn start_session(&self, config: SessionConfig) -> Result<Uuid> {
        let pipeline = config
            .strategy
            .build()
            .with_context(|| format!("Invalid strategy config '{}'", config.strategy.strategy))?;
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel::<OrderPlaced>();
        let orders_placed = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&orders_placed);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                counter.fetch_add(1, Ordering::SeqCst);
                info!(
                    "[session {}] {} {} {:.8} @ {:.4} sl={:?} tp={:?}",
                    id,
                    event.side,
                    event.symbol,
                    event.quantity,
                    event.price,
                    event.stop_loss,
                    event.take_profit
                );
            }
        });

        let session = Arc::new(Session {
            id,
            strategy: config.strategy.strategy.clone(),
            symbols: config.trading.symbols.clone(),
            started_at: Utc::now(),
            stopped_at: Mutex::new(None),
            orders_placed,
            engine: TradingEngine::new(Arc::clone(&self.exchange), pipeline, config.trading, tx),
        });
        session.engine.start()?;
        self.sessions.insert(id, session);
        info!("Started session {}", id);
        Ok(id)
    }

    pub async fn stop_session(&self, id: Uuid) -> Result<SessionInfo> {
        let session = self
            .sessions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| anyhow!("Unknown session {}", id))?;
        session.engine.stop().await?;
        {
            let mut stopped_at = session
                .stopped_at
                .lock()
                .map_err(|_| anyhow!("session {} state is poisoned", id))?;
            stopped_at.get_or_insert_with(Utc::now);
        }
        info!("Stopped session {}", id);
        session.info()
    }

    pub fn get_session(&self, id: Uuid) -> Result<Option<SessionInfo>> {
        let session = self.sessions.get(&id).map(|entry| Arc::clone(entry.value()));
        session.map(|session| session.info()).transpose()
    }

    /// Snapshots of every session, oldest first.
    pub fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut infos = sessions
            .iter()
            .map(|session| session.info())
            .collect::<Result<Vec<_>>>()?;
        infos.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(infos)
    }
}
