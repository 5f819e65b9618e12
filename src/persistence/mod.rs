//! Durable log and current-state tables for cycles, orders and positions.
//!
//! Append-only history:
//! - Cycle snapshots and transitions
//! - Each stage's surviving candidates
//! - Every order and position change
//! - Audit events (reconciliation corrections, fail-safe closes, ...)
//!
//! Current state (upserted): cycles, orders, positions. Reconciliation and
//! restart recovery read from these.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::cycle::{Cycle, CycleId, Transition};
use crate::execution::{Order, Position};
use crate::strategy::{Candidate, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    ReconciliationCorrection,
    IllegalTransition,
    UnknownOrder,
    InvariantViolation,
    FailSafeClose,
    ForceClose,
    OrphanCancelled,
    RemainderCancelled,
    EmergencyTriggered,
    RiskBudgetExceeded,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::ReconciliationCorrection => "reconciliation_correction",
            AuditKind::IllegalTransition => "illegal_transition",
            AuditKind::UnknownOrder => "unknown_order",
            AuditKind::InvariantViolation => "invariant_violation",
            AuditKind::FailSafeClose => "fail_safe_close",
            AuditKind::ForceClose => "force_close",
            AuditKind::OrphanCancelled => "orphan_cancelled",
            AuditKind::RemainderCancelled => "remainder_cancelled",
            AuditKind::EmergencyTriggered => "emergency_triggered",
            AuditKind::RiskBudgetExceeded => "risk_budget_exceeded",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| anyhow!("unknown audit kind '{}'", s))
    }
}

/// Something the system corrected or refused, kept for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub kind: AuditKind,
    pub cycle_id: Option<CycleId>,
    /// Order client id, position id or symbol the event is about
    pub subject: String,
    pub detail: String,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            kind,
            cycle_id: None,
            subject: subject.into(),
            detail: detail.into(),
        }
    }

    pub fn for_cycle(mut self, cycle_id: CycleId) -> Self {
        self.cycle_id = Some(cycle_id);
        self
    }
}

/// Row of the current cycles table, for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleRecord {
    pub id: String,
    pub mode: String,
    pub status: String,
    pub degraded: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
}

/// Repository for everything the engine must not forget.
pub trait TradeStore: Send + Sync {
    /// Append a cycle snapshot and upsert its current row.
    fn record_cycle(&self, cycle: &Cycle) -> Result<()>;

    fn record_transition(&self, cycle_id: CycleId, transition: &Transition) -> Result<()>;

    /// Append a stage's output.
    fn record_candidates(&self, cycle_id: CycleId, stage: Stage, candidates: &[Candidate])
        -> Result<()>;

    /// Append an order change and upsert its current row.
    fn record_order(&self, order: &Order) -> Result<()>;

    /// Append a position change and upsert its current row.
    fn record_position(&self, position: &Position) -> Result<()>;

    fn record_audit(&self, event: &AuditEvent) -> Result<()>;

    /// Current state of every order.
    fn load_orders(&self) -> Result<Vec<Order>>;

    /// Current state of every position.
    fn load_positions(&self) -> Result<Vec<Position>>;

    /// Most recent cycles first.
    fn recent_cycles(&self, limit: usize) -> Result<Vec<CycleRecord>>;

    /// Most recent audit events first.
    fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEvent>>;
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// =============================================================================
// SQLite
// =============================================================================

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database and initialize the schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("Trade store initialized at {:?}", path);
        Ok(store)
    }

    /// In-memory database (tests and dry runs).
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("trade store connection lock poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            -- Current cycle rows
            CREATE TABLE IF NOT EXISTS cycles (
                id TEXT PRIMARY KEY,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                degraded INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                summary TEXT,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cycles_started ON cycles(started_at);

            -- Cycle snapshot history
            CREATE TABLE IF NOT EXISTS cycles_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id TEXT NOT NULL,
                status TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cycle_transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id TEXT NOT NULL,
                from_status TEXT NOT NULL,
                to_status TEXT NOT NULL,
                at TEXT NOT NULL,
                note TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_transitions_cycle ON cycle_transitions(cycle_id);

            CREATE TABLE IF NOT EXISTS candidates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                instrument_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                composite_score TEXT,
                rank INTEGER,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_candidates_cycle ON candidates(cycle_id, stage);

            -- Current order rows
            CREATE TABLE IF NOT EXISTS orders (
                client_order_id TEXT PRIMARY KEY,
                cycle_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                role TEXT NOT NULL,
                status TEXT NOT NULL,
                quantity TEXT NOT NULL,
                filled_quantity TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS order_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_order_id TEXT NOT NULL,
                status TEXT NOT NULL,
                filled_quantity TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                recorded_at TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_order_events_order ON order_events(client_order_id);

            -- Current position rows
            CREATE TABLE IF NOT EXISTS positions (
                position_id INTEGER PRIMARY KEY,
                cycle_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                status TEXT NOT NULL,
                quantity TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                stop_loss TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS position_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                quantity TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                at TEXT NOT NULL,
                kind TEXT NOT NULL,
                cycle_id TEXT,
                subject TEXT NOT NULL,
                detail TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_at ON audit_events(at);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }
}

impl TradeStore for SqliteStore {
    fn record_cycle(&self, cycle: &Cycle) -> Result<()> {
        let payload = serde_json::to_string(cycle).context("Failed to serialize cycle")?;
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            r#"
            INSERT INTO cycles (id, mode, status, degraded, started_at, ended_at, summary, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                status = ?3,
                degraded = ?4,
                ended_at = ?6,
                summary = ?7,
                payload = ?8
            "#,
            params![
                cycle.id.to_string(),
                cycle.mode.to_string(),
                cycle.status.to_string(),
                cycle.degraded as i32,
                cycle.started_at.to_rfc3339(),
                cycle.ended_at.map(|t| t.to_rfc3339()),
                cycle.summary,
                payload,
            ],
        )?;
        tx.execute(
            "INSERT INTO cycles_log (cycle_id, status, recorded_at, payload) VALUES (?1, ?2, ?3, ?4)",
            params![
                cycle.id.to_string(),
                cycle.status.to_string(),
                Utc::now().to_rfc3339(),
                payload,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn record_transition(&self, cycle_id: CycleId, transition: &Transition) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO cycle_transitions (cycle_id, from_status, to_status, at, note)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                cycle_id.to_string(),
                transition.from.to_string(),
                transition.to.to_string(),
                transition.at.to_rfc3339(),
                transition.note,
            ],
        )?;
        Ok(())
    }

    fn record_candidates(
        &self,
        cycle_id: CycleId,
        stage: Stage,
        candidates: &[Candidate],
    ) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        for candidate in candidates {
            tx.execute(
                r#"
                INSERT INTO candidates (cycle_id, stage, instrument_id, symbol, composite_score, rank, payload)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    cycle_id.to_string(),
                    stage.as_str(),
                    candidate.id().0 as i64,
                    candidate.symbol(),
                    candidate.composite_score.map(|s| s.to_string()),
                    candidate.rank,
                    serde_json::to_string(candidate).context("Failed to serialize candidate")?,
                ],
            )?;
        }

        tx.commit()?;
        debug!(%cycle_id, stage = %stage, count = candidates.len(), "Candidates recorded");
        Ok(())
    }

    fn record_order(&self, order: &Order) -> Result<()> {
        let payload = serde_json::to_string(order).context("Failed to serialize order")?;
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            r#"
            INSERT INTO orders (client_order_id, cycle_id, symbol, role, status, quantity,
                                filled_quantity, updated_at, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(client_order_id) DO UPDATE SET
                status = ?5,
                filled_quantity = ?7,
                updated_at = ?8,
                payload = ?9
            "#,
            params![
                order.client_order_id,
                order.cycle_id.to_string(),
                order.symbol,
                order.role.code(),
                order.status.to_string(),
                order.quantity.to_string(),
                order.filled_quantity.to_string(),
                order.updated_at.to_rfc3339(),
                payload,
            ],
        )?;
        tx.execute(
            r#"
            INSERT INTO order_events (client_order_id, status, filled_quantity, sequence, recorded_at, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                order.client_order_id,
                order.status.to_string(),
                order.filled_quantity.to_string(),
                order.last_sequence as i64,
                Utc::now().to_rfc3339(),
                payload,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn record_position(&self, position: &Position) -> Result<()> {
        let payload = serde_json::to_string(position).context("Failed to serialize position")?;
        let status = format!("{:?}", position.status);
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            r#"
            INSERT INTO positions (position_id, cycle_id, symbol, status, quantity, entry_price,
                                   stop_loss, realized_pnl, updated_at, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(position_id) DO UPDATE SET
                status = ?4,
                quantity = ?5,
                stop_loss = ?7,
                realized_pnl = ?8,
                updated_at = ?9,
                payload = ?10
            "#,
            params![
                position.id.0 as i64,
                position.cycle_id.to_string(),
                position.symbol,
                status,
                position.quantity.to_string(),
                position.entry_price.to_string(),
                position.stop_loss.to_string(),
                position.realized_pnl.to_string(),
                Utc::now().to_rfc3339(),
                payload,
            ],
        )?;
        tx.execute(
            r#"
            INSERT INTO position_events (position_id, status, quantity, recorded_at, payload)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                position.id.0 as i64,
                status,
                position.quantity.to_string(),
                Utc::now().to_rfc3339(),
                payload,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn record_audit(&self, event: &AuditEvent) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO audit_events (at, kind, cycle_id, subject, detail)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                event.at.to_rfc3339(),
                event.kind.as_str(),
                event.cycle_id.map(|id| id.to_string()),
                event.subject,
                event.detail,
            ],
        )?;
        Ok(())
    }

    fn load_orders(&self) -> Result<Vec<Order>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT payload FROM orders ORDER BY updated_at")?;
        let payloads: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();

        payloads
            .iter()
            .map(|p| serde_json::from_str(p).context("Failed to decode stored order"))
            .collect()
    }

    fn load_positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT payload FROM positions ORDER BY position_id")?;
        let payloads: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();

        payloads
            .iter()
            .map(|p| serde_json::from_str(p).context("Failed to decode stored position"))
            .collect()
    }

    fn recent_cycles(&self, limit: usize) -> Result<Vec<CycleRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, mode, status, degraded, started_at, ended_at, summary
            FROM cycles
            ORDER BY started_at DESC
            LIMIT ?1
            "#,
        )?;

        let cycles = stmt
            .query_map([limit as i64], |row| {
                let started_at: String = row.get(4)?;
                let ended_at: Option<String> = row.get(5)?;
                Ok(CycleRecord {
                    id: row.get(0)?,
                    mode: row.get(1)?,
                    status: row.get(2)?,
                    degraded: row.get::<_, i32>(3)? != 0,
                    started_at: parse_time(&started_at),
                    ended_at: ended_at.as_deref().map(parse_time),
                    summary: row.get(6)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(cycles)
    }

    fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT at, kind, cycle_id, subject, detail
            FROM audit_events
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let rows: Vec<(String, String, Option<String>, String, String)> = stmt
            .query_map([limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(rows
            .into_iter()
            .filter_map(|(at, kind, cycle_id, subject, detail)| {
                Some(AuditEvent {
                    at: parse_time(&at),
                    kind: AuditKind::from_str(&kind).ok()?,
                    cycle_id: cycle_id
                        .and_then(|id| uuid::Uuid::parse_str(&id).ok())
                        .map(CycleId),
                    subject,
                    detail,
                })
            })
            .collect())
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    cycles: HashMap<CycleId, Cycle>,
    cycle_log: Vec<Cycle>,
    transitions: Vec<(CycleId, Transition)>,
    candidates: Vec<(CycleId, Stage, Candidate)>,
    orders: HashMap<String, Order>,
    order_log: Vec<Order>,
    positions: HashMap<u64, Position>,
    position_log: Vec<Position>,
    audit: Vec<AuditEvent>,
}

/// Store that keeps everything in memory, with inspection helpers for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }

    pub fn transitions(&self, cycle_id: CycleId) -> Vec<Transition> {
        self.state()
            .map(|s| {
                s.transitions
                    .iter()
                    .filter(|(id, _)| *id == cycle_id)
                    .map(|(_, t)| t.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn candidates(&self, cycle_id: CycleId, stage: Stage) -> Vec<Candidate> {
        self.state()
            .map(|s| {
                s.candidates
                    .iter()
                    .filter(|(id, st, _)| *id == cycle_id && *st == stage)
                    .map(|(_, _, c)| c.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.state().map(|s| s.audit.clone()).unwrap_or_default()
    }

    /// Every recorded version of one order, oldest first.
    pub fn order_history(&self, client_order_id: &str) -> Vec<Order> {
        self.state()
            .map(|s| {
                s.order_log
                    .iter()
                    .filter(|o| o.client_order_id == client_order_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn position_history_len(&self) -> usize {
        self.state().map(|s| s.position_log.len()).unwrap_or_default()
    }

    pub fn cycle(&self, cycle_id: CycleId) -> Option<Cycle> {
        self.state().ok()?.cycles.get(&cycle_id).cloned()
    }
}

impl TradeStore for MemoryStore {
    fn record_cycle(&self, cycle: &Cycle) -> Result<()> {
        let mut state = self.state()?;
        state.cycles.insert(cycle.id, cycle.clone());
        state.cycle_log.push(cycle.clone());
        Ok(())
    }

    fn record_transition(&self, cycle_id: CycleId, transition: &Transition) -> Result<()> {
        self.state()?.transitions.push((cycle_id, transition.clone()));
        Ok(())
    }

    fn record_candidates(
        &self,
        cycle_id: CycleId,
        stage: Stage,
        candidates: &[Candidate],
    ) -> Result<()> {
        let mut state = self.state()?;
        state
            .candidates
            .extend(candidates.iter().map(|c| (cycle_id, stage, c.clone())));
        Ok(())
    }

    fn record_order(&self, order: &Order) -> Result<()> {
        let mut state = self.state()?;
        state.orders.insert(order.client_order_id.clone(), order.clone());
        state.order_log.push(order.clone());
        Ok(())
    }

    fn record_position(&self, position: &Position) -> Result<()> {
        let mut state = self.state()?;
        state.positions.insert(position.id.0, position.clone());
        state.position_log.push(position.clone());
        Ok(())
    }

    fn record_audit(&self, event: &AuditEvent) -> Result<()> {
        self.state()?.audit.push(event.clone());
        Ok(())
    }

    fn load_orders(&self) -> Result<Vec<Order>> {
        let state = self.state()?;
        let mut orders: Vec<Order> = state.orders.values().cloned().collect();
        orders.sort_by_key(|o| o.id);
        Ok(orders)
    }

    fn load_positions(&self) -> Result<Vec<Position>> {
        let state = self.state()?;
        let mut positions: Vec<Position> = state.positions.values().cloned().collect();
        positions.sort_by_key(|p| p.id);
        Ok(positions)
    }

    fn recent_cycles(&self, limit: usize) -> Result<Vec<CycleRecord>> {
        let state = self.state()?;
        let mut cycles: Vec<&Cycle> = state.cycles.values().collect();
        cycles.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(cycles
            .into_iter()
            .take(limit)
            .map(|c| CycleRecord {
                id: c.id.to_string(),
                mode: c.mode.to_string(),
                status: c.status.to_string(),
                degraded: c.degraded,
                started_at: c.started_at,
                ended_at: c.ended_at,
                summary: c.summary.clone(),
            })
            .collect())
    }

    fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let state = self.state()?;
        Ok(state.audit.iter().rev().take(limit).cloned().collect())
    }
}
