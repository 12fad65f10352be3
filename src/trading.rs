use crate::candle_utils::{last_timestamp, merge_candles};
use crate::config::TradingSettings;
use crate::error::{is_cancellation, EngineError};
use crate::exchange::SharedExchange;
use crate::models::*;
use crate::series::{CandleMap, CandleSeries};
use crate::strategy::StrategyPipeline;
use crate::trading_rules::live_order_quantity;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Position opened by the live engine and not yet closed by a sell signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPosition {
    pub symbol: String,
    pub order_id: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_timestamp: DateTime<Utc>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub use_hold_strategy: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolStatus {
    pub symbol: String,
    pub candle_count: usize,
    pub last_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingStatus {
    pub running: bool,
    pub symbols: Vec<SymbolStatus>,
    pub open_positions: Vec<OpenPosition>,
}

struct RunningTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// State shared between the engine handle and its polling task.
struct EngineState {
    exchange: SharedExchange,
    strategy: StrategyPipeline,
    settings: TradingSettings,
    buffers: Mutex<HashMap<String, Vec<Candle>>>,
    positions: Mutex<HashMap<String, OpenPosition>>,
    running: AtomicBool,
    notifier: mpsc::UnboundedSender<OrderPlaced>,
}

/// Polls the exchange for new candles and trades the latest bar of each symbol.
pub struct TradingEngine {
    state: Arc<EngineState>,
    task: Mutex<Option<RunningTask>>,
}

impl TradingEngine {
    pub fn new(
        exchange: SharedExchange,
        strategy: StrategyPipeline,
        settings: TradingSettings,
        notifier: mpsc::UnboundedSender<OrderPlaced>,
    ) -> Self {
        let buffers = settings
            .symbols
            .iter()
            .map(|symbol| (symbol.clone(), Vec::new()))
            .collect();
        Self {
            state: Arc::new(EngineState {
                exchange,
                strategy,
                settings,
                buffers: Mutex::new(buffers),
                positions: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                notifier,
            }),
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Spawns the polling task. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut task = lock(&self.task, "trading task")?;
        if self.is_running() {
            debug!("Trading engine already running");
            return Ok(());
        }

        let (cancel, cancel_rx) = watch::channel(false);
        self.state.running.store(true, Ordering::SeqCst);
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            state.run(cancel_rx).await;
            state.running.store(false, Ordering::SeqCst);
        });
        info!(
            "Started trading {} on {} ({})",
            self.state.strategy.name(),
            self.state.settings.symbols.join(", "),
            self.state.settings.timeframe
        );
        *task = Some(RunningTask { cancel, handle });
        Ok(())
    }

    /// Signals the polling task and waits for it to finish its current iteration.
    pub async fn stop(&self) -> Result<()> {
        let running = lock(&self.task, "trading task")?.take();
        let Some(RunningTask { cancel, handle }) = running else {
            return Ok(());
        };
        let _ = cancel.send(true);
        if let Err(err) = handle.await {
            warn!("Trading task ended abnormally: {}", err);
        }
        self.state.running.store(false, Ordering::SeqCst);
        info!("Stopped trading {}", self.state.strategy.name());
        Ok(())
    }

    pub fn status(&self) -> Result<TradingStatus> {
        let symbols = {
            let buffers = self.state.lock_buffers()?;
            let mut symbols: Vec<SymbolStatus> = buffers
                .iter()
                .map(|(symbol, candles)| SymbolStatus {
                    symbol: symbol.clone(),
                    candle_count: candles.len(),
                    last_timestamp: last_timestamp(candles),
                })
                .collect();
            symbols.sort_by(|a, b| a.symbol.cmp(&b.symbol));
            symbols
        };
        let mut open_positions: Vec<OpenPosition> =
            self.state.lock_positions()?.values().cloned().collect();
        open_positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        Ok(TradingStatus {
            running: self.is_running(),
            symbols,
            open_positions,
        })
    }
}

/// Resolves once a stop is requested or the engine handle is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| anyhow!("{} lock is poisoned", what))
}

impl EngineState {
    fn lock_buffers(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<Candle>>>> {
        lock(&self.buffers, "candle buffer")
    }

    fn lock_positions(&self) -> Result<MutexGuard<'_, HashMap<String, OpenPosition>>> {
        lock(&self.positions, "position")
    }

    async fn run(&self, mut cancel: watch::Receiver<bool>) {
        let startup = tokio::select! {
            loaded = self.load_history() => loaded,
            _ = cancelled(&mut cancel) => Err(EngineError::Cancelled.into()),
        };
        match startup {
            Ok(()) => {}
            Err(err) if is_cancellation(&err) => {
                debug!("Trading engine stopped while loading history");
                return;
            }
            Err(err) => {
                error!("Trading engine failed to start: {:#}", err);
                return;
            }
        }

        loop {
            if *cancel.borrow() {
                break;
            }
            if let Err(err) = self.run_iteration().await {
                error!("Trading iteration failed: {:#}", err);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = cancel.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Trading loop for {} exited", self.strategy.name());
    }

    async fn load_history(&self) -> Result<()> {
        let to = Utc::now();
        let from = to - Duration::days(self.settings.history_lookback_days);
        let fetches = self.settings.symbols.iter().map(|symbol| async move {
            let candles = self
                .exchange
                .get_historical_data(symbol, self.settings.timeframe, from, to)
                .await
                .with_context(|| format!("Failed to load initial history for {}", symbol))?;
            Ok::<_, anyhow::Error>((symbol.clone(), candles))
        });

        let mut loaded = Vec::new();
        for result in join_all(fetches).await {
            loaded.push(result?);
        }

        let mut buffers = self.lock_buffers()?;
        for (symbol, candles) in loaded {
            let buffer = buffers.entry(symbol.clone()).or_default();
            let added = merge_candles(buffer, candles);
            info!("Loaded {} {} candles for {}", added, self.settings.timeframe, symbol);
        }
        Ok(())
    }

    async fn run_iteration(&self) -> Result<()> {
        self.poll_new_candles().await?;

        let candle_map = self.snapshot_series()?;
        let latest: HashMap<&str, DateTime<Utc>> = candle_map
            .iter()
            .filter_map(|(symbol, series)| series.last().map(|c| (symbol.as_str(), c.timestamp)))
            .collect();
        let actionable: Vec<Signal> = self
            .strategy
            .get_filtered_signals(&candle_map)
            .into_iter()
            .filter(|signal| latest.get(signal.symbol.as_str()) == Some(&signal.timestamp))
            .collect();

        for signal in actionable {
            if let Err(err) = self.act_on_signal(&signal).await {
                error!(
                    "Failed to act on {} signal for {}: {:#}",
                    signal.signal_type.as_str(),
                    signal.symbol,
                    err
                );
            }
        }
        Ok(())
    }

    async fn poll_new_candles(&self) -> Result<()> {
        let to = Utc::now();
        let since: Vec<(String, DateTime<Utc>)> = {
            let buffers = self.lock_buffers()?;
            self.settings
                .symbols
                .iter()
                .map(|symbol| {
                    let from = buffers
                        .get(symbol)
                        .and_then(|candles| last_timestamp(candles))
                        .map(|ts| ts + Duration::seconds(1))
                        .unwrap_or_else(|| to - Duration::days(self.settings.history_lookback_days));
                    (symbol.clone(), from)
                })
                .collect()
        };

        let fetches = since.into_iter().map(|(symbol, from)| async move {
            let result = self
                .exchange
                .get_historical_data(&symbol, self.settings.timeframe, from, to)
                .await;
            (symbol, result)
        });

        for (symbol, result) in join_all(fetches).await {
            match result {
                Ok(candles) if candles.is_empty() => {}
                Ok(candles) => {
                    let mut buffers = self.lock_buffers()?;
                    let added = merge_candles(buffers.entry(symbol.clone()).or_default(), candles);
                    debug!("Merged {} new candles for {}", added, symbol);
                }
                Err(err) => warn!("Failed to poll candles for {}: {:#}", symbol, err),
            }
        }
        Ok(())
    }

    fn snapshot_series(&self) -> Result<CandleMap> {
        let buffers = self.lock_buffers()?;
        Ok(buffers
            .iter()
            .filter(|(_, candles)| !candles.is_empty())
            .map(|(symbol, candles)| (symbol.clone(), CandleSeries::new(symbol.clone(), candles.clone())))
            .collect())
    }

    async fn act_on_signal(&self, signal: &Signal) -> Result<()> {
        let has_position = self.lock_positions()?.contains_key(&signal.symbol);
        match (signal.signal_type, has_position) {
            (SignalType::Buy, false) => self.open_position(signal).await,
            (SignalType::Sell, true) => self.close_position(signal).await,
            _ => Ok(()),
        }
    }

    async fn open_position(&self, signal: &Signal) -> Result<()> {
        if signal.price <= 0.0 {
            warn!(
                "Skipping buy for {}: invalid signal price {}",
                signal.symbol, signal.price
            );
            return Ok(());
        }
        let balance = self
            .exchange
            .get_balance(&self.settings.quote_asset)
            .await
            .with_context(|| format!("Failed to read {} balance", self.settings.quote_asset))?;
        let Some(quantity) =
            live_order_quantity(&self.settings.trade_sizing, balance.free, signal.price)
        else {
            warn!(
                "Skipping buy for {}: {} balance {:.2} too small",
                signal.symbol, balance.asset, balance.free
            );
            return Ok(());
        };

        let stop_loss = if signal.use_hold_strategy {
            None
        } else {
            signal.stop_loss
        };
        let request = OrderRequest {
            symbol: signal.symbol.clone(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity,
            price: Some(signal.price),
            stop_loss,
            take_profit: signal.take_profit,
        };
        let order = self.submit(&request).await?;

        self.lock_positions()?.insert(
            signal.symbol.clone(),
            OpenPosition {
                symbol: signal.symbol.clone(),
                order_id: order.id.clone(),
                quantity: order.quantity,
                entry_price: signal.price,
                entry_timestamp: signal.timestamp,
                stop_loss,
                take_profit: signal.take_profit,
                use_hold_strategy: signal.use_hold_strategy,
            },
        );
        self.notify(&order, &request, signal.price);
        Ok(())
    }

    async fn close_position(&self, signal: &Signal) -> Result<()> {
        if signal.price <= 0.0 {
            warn!(
                "Skipping sell for {}: invalid signal price {}",
                signal.symbol, signal.price
            );
            return Ok(());
        }
        let position = self.lock_positions()?.get(&signal.symbol).cloned();
        let Some(position) = position else {
            return Ok(());
        };
        let request = OrderRequest {
            symbol: signal.symbol.clone(),
            side: OrderSide::Sell,
            order_type: OrderType::Market,
            quantity: position.quantity,
            price: Some(signal.price),
            stop_loss: None,
            take_profit: None,
        };
        let order = self.submit(&request).await?;

        self.lock_positions()?.remove(&signal.symbol);
        self.notify(&order, &request, signal.price);
        Ok(())
    }

    /// Places the order and treats an exchange-side refusal as a failure.
    async fn submit(&self, request: &OrderRequest) -> Result<Order> {
        let order = self
            .exchange
            .place_order(request)
            .await
            .with_context(|| format!("Failed to place {} order for {}", request.side, request.symbol))?;
        if matches!(order.status, OrderStatus::Rejected | OrderStatus::Canceled) {
            return Err(anyhow!(
                "{} order {} for {} was {:?}",
                request.side,
                order.id,
                request.symbol,
                order.status
            ));
        }
        info!(
            "Placed {} {} {:.8} @ {:.4} (order {})",
            request.side, request.symbol, request.quantity, request.price.unwrap_or(0.0), order.id
        );
        Ok(order)
    }

    fn notify(&self, order: &Order, request: &OrderRequest, price: f64) {
        let event = OrderPlaced {
            order_id: order.id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: order.quantity,
            price,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            timestamp: order.created_at,
        };
        if self.notifier.send(event).is_err() {
            debug!("No listener for order notifications");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_utils::candles_in_range;
    use crate::config::{Timeframe, TradeSizeMode, TradeSizing};
    use crate::exchange::Exchange;
    use crate::filters::create_filter;
    use crate::strategy::Strategy;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    /// Buys on up bars, sells on down bars.
    struct FollowMovement;

    impl Strategy for FollowMovement {
        fn name(&self) -> &str {
            "follow_movement"
        }

        fn generate_signal(&self, series: &CandleSeries, candle_index: usize) -> Option<SignalType> {
            match series.get(candle_index)?.movement {
                Movement::Up => Some(SignalType::Buy),
                Movement::Down => Some(SignalType::Sell),
            }
        }

        fn min_data_points(&self) -> usize {
            1
        }
    }

    #[derive(Default)]
    struct StubExchange {
        candles: Mutex<Vec<Candle>>,
        orders: Mutex<Vec<OrderRequest>>,
        fail_history: bool,
        reject_orders: bool,
        /// 1-based history calls that fail.
        failing_calls: Vec<usize>,
        /// Served only once every failing call has happened.
        late_candles: Vec<Candle>,
        calls: AtomicUsize,
        hang_history: bool,
    }

    impl StubExchange {
        fn with_candles(candles: Vec<Candle>) -> Self {
            Self {
                candles: Mutex::new(candles),
                ..Default::default()
            }
        }

        fn push(&self, candle: Candle) {
            self.candles.lock().unwrap().push(candle);
        }

        fn orders(&self) -> Vec<OrderRequest> {
            self.orders.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Exchange for StubExchange {
        async fn get_historical_data(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<Candle>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.hang_history {
                std::future::pending::<()>().await;
            }
            if self.fail_history || self.failing_calls.contains(&call) {
                return Err(anyhow!("exchange unavailable"));
            }
            let mut candles = self.candles.lock().unwrap().clone();
            if self.failing_calls.iter().all(|&failing| failing < call) {
                candles.extend(self.late_candles.iter().cloned());
            }
            Ok(candles_in_range(&candles, from, to))
        }

        async fn place_order(&self, request: &OrderRequest) -> Result<Order> {
            let mut orders = self.orders.lock().unwrap();
            orders.push(request.clone());
            Ok(Order {
                id: format!("order-{}", orders.len()),
                symbol: request.symbol.clone(),
                side: request.side,
                order_type: request.order_type,
                quantity: request.quantity,
                price: request.price,
                status: if self.reject_orders {
                    OrderStatus::Rejected
                } else {
                    OrderStatus::Filled
                },
                created_at: Utc::now(),
            })
        }

        async fn get_order(&self, _symbol: &str, order_id: &str) -> Result<Order> {
            Err(anyhow!("unknown order {}", order_id))
        }

        async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<Order> {
            Err(anyhow!("unknown order {}", order_id))
        }

        async fn get_balance(&self, asset: &str) -> Result<Balance> {
            Ok(Balance {
                asset: asset.to_string(),
                free: 1_000.0,
                locked: 0.0,
            })
        }
    }

    fn minutes_ago(minutes: i64) -> DateTime<Utc> {
        Utc::now() - Duration::minutes(minutes)
    }

    fn up(ts: DateTime<Utc>, close: f64) -> Candle {
        Candle::new(ts, close - 1.0, close + 1.0, close - 2.0, close, 10.0, 5)
    }

    fn down(ts: DateTime<Utc>, close: f64) -> Candle {
        Candle::new(ts, close + 1.0, close + 2.0, close - 1.0, close, 10.0, 5)
    }

    fn settings(poll_interval: StdDuration) -> TradingSettings {
        TradingSettings {
            symbols: vec!["BTCUSDT".to_string()],
            timeframe: Timeframe::OneMinute,
            poll_interval,
            trade_sizing: TradeSizing::new(TradeSizeMode::FixedAmount, 100.0).unwrap(),
            quote_asset: "USDT".to_string(),
            history_lookback_days: 100,
        }
    }

    fn engine(
        exchange: Arc<StubExchange>,
        strategy: StrategyPipeline,
        poll_interval: StdDuration,
    ) -> (TradingEngine, mpsc::UnboundedReceiver<OrderPlaced>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            TradingEngine::new(exchange, strategy, settings(poll_interval), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn trades_only_the_latest_candle() {
        let _ = env_logger::builder().is_test(true).try_init();
        let exchange = Arc::new(StubExchange::with_candles(vec![
            down(minutes_ago(30), 100.0),
            up(minutes_ago(20), 101.0),
            up(minutes_ago(10), 102.0),
        ]));
        let (engine, mut notifications) = engine(
            exchange.clone(),
            StrategyPipeline::new(Box::new(FollowMovement)),
            StdDuration::from_secs(60),
        );

        engine.state.load_history().await.unwrap();
        engine.state.run_iteration().await.unwrap();
        let orders = exchange.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert_eq!(orders[0].price, Some(102.0));
        assert!((orders[0].quantity - 100.0 / 102.0).abs() < 1e-12);

        // Same latest candle with an open position: no pyramiding.
        engine.state.run_iteration().await.unwrap();
        assert_eq!(exchange.orders().len(), 1);

        exchange.push(down(minutes_ago(1), 104.0));
        engine.state.run_iteration().await.unwrap();
        let orders = exchange.orders();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[1].side, OrderSide::Sell);
        assert_eq!(orders[1].quantity, orders[0].quantity);

        let first = notifications.recv().await.unwrap();
        let second = notifications.recv().await.unwrap();
        assert_eq!((first.side, second.side), (OrderSide::Buy, OrderSide::Sell));

        let status = engine.status().unwrap();
        assert!(status.open_positions.is_empty());
        assert_eq!(status.symbols[0].candle_count, 4);
    }

    #[tokio::test]
    async fn hold_flagged_buy_is_placed_without_stop_loss() {
        let exchange = Arc::new(StubExchange::with_candles(vec![up(minutes_ago(5), 200.0)]));
        let params: HashMap<String, f64> = HashMap::from([
            ("takeProfitPercentage".to_string(), 10.0),
            ("stopLossPercentage".to_string(), 5.0),
            ("useHoldStrategyForLongs".to_string(), 1.0),
        ]);
        let strategy = StrategyPipeline::new(Box::new(FollowMovement))
            .with_filter(create_filter("take_profit_stop_loss", &params).unwrap());
        let (engine, _rx) = engine(exchange.clone(), strategy, StdDuration::from_secs(60));

        engine.state.load_history().await.unwrap();
        engine.state.run_iteration().await.unwrap();

        let orders = exchange.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].stop_loss, None);
        assert!((orders[0].take_profit.unwrap() - 220.0).abs() < 1e-9);
        let positions = engine.status().unwrap().open_positions;
        assert!(positions[0].use_hold_strategy);
    }

    #[tokio::test]
    async fn rejected_orders_leave_no_position() {
        let exchange = Arc::new(StubExchange {
            candles: Mutex::new(vec![up(minutes_ago(5), 200.0)]),
            reject_orders: true,
            ..Default::default()
        });
        let (engine, mut rx) = engine(
            exchange.clone(),
            StrategyPipeline::new(Box::new(FollowMovement)),
            StdDuration::from_secs(60),
        );
        engine.state.load_history().await.unwrap();
        engine.state.run_iteration().await.unwrap();

        assert_eq!(exchange.orders().len(), 1);
        assert!(engine.status().unwrap().open_positions.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn zero_price_signal_is_skipped() {
        let exchange = Arc::new(StubExchange::with_candles(vec![Candle::new(
            minutes_ago(5),
            -1.0,
            0.0,
            -1.0,
            0.0,
            1.0,
            1,
        )]));
        let (engine, _rx) = engine(
            exchange.clone(),
            StrategyPipeline::new(Box::new(FollowMovement)),
            StdDuration::from_secs(60),
        );
        engine.state.load_history().await.unwrap();
        engine.state.run_iteration().await.unwrap();
        assert!(exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn startup_failure_leaves_engine_stopped() {
        let exchange = Arc::new(StubExchange {
            fail_history: true,
            ..Default::default()
        });
        let (engine, _rx) = engine(
            exchange,
            StrategyPipeline::new(Box::new(FollowMovement)),
            StdDuration::from_secs(60),
        );
        engine.start().unwrap();
        for _ in 0..100 {
            if !engine.is_running() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        assert!(!engine.is_running());
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_polls_are_retried_on_the_next_interval() {
        let _ = env_logger::builder().is_test(true).try_init();
        let exchange = Arc::new(StubExchange {
            candles: Mutex::new(vec![down(minutes_ago(10), 100.0)]),
            failing_calls: vec![2, 3],
            late_candles: vec![up(minutes_ago(1), 103.0)],
            ..Default::default()
        });
        let (engine, mut rx) = engine(
            exchange.clone(),
            StrategyPipeline::new(Box::new(FollowMovement)),
            StdDuration::from_millis(10),
        );
        engine.start().unwrap();

        let event = tokio::time::timeout(StdDuration::from_secs(2), rx.recv())
            .await
            .expect("a buy should follow the recovered poll")
            .unwrap();
        assert_eq!(event.side, OrderSide::Buy);
        assert_eq!(event.price, 103.0);
        assert!(exchange.calls.load(Ordering::SeqCst) >= 4);
        assert!(engine.is_running());
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_during_history_load_ends_the_task() {
        let exchange = Arc::new(StubExchange {
            hang_history: true,
            ..Default::default()
        });
        let (engine, _rx) = engine(
            exchange.clone(),
            StrategyPipeline::new(Box::new(FollowMovement)),
            StdDuration::from_secs(60),
        );
        engine.start().unwrap();
        for _ in 0..100 {
            if exchange.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        assert!(engine.is_running());

        tokio::time::timeout(StdDuration::from_secs(2), engine.stop())
            .await
            .expect("stop should not wait for the history fetch")
            .unwrap();
        assert!(!engine.is_running());
        assert_eq!(engine.status().unwrap().symbols[0].candle_count, 0);
    }

    #[tokio::test]
    async fn stop_interrupts_the_poll_sleep() {
        let exchange = Arc::new(StubExchange::with_candles(vec![down(minutes_ago(5), 50.0)]));
        let (engine, _rx) = engine(
            exchange,
            StrategyPipeline::new(Box::new(FollowMovement)),
            StdDuration::from_secs(3_600),
        );
        engine.start().unwrap();
        // A second start while running is a no-op.
        engine.start().unwrap();
        for _ in 0..100 {
            if engine.status().unwrap().symbols[0].candle_count > 0 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        assert!(engine.is_running());

        tokio::time::timeout(StdDuration::from_secs(2), engine.stop())
            .await
            .expect("stop should not wait for the poll interval")
            .unwrap();
        assert!(!engine.is_running());
        // Stopping twice is a no-op.
        engine.stop().await.unwrap();
    }
}
