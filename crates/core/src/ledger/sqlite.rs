//! SQLite-backed ledger store implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::order::{
    from_minor_units, line_amount, to_minor_units, Account, Order, OrderStatus, Unit, UnitStatus,
};

use super::store::{
    Cancellation, LedgerError, LedgerStore, LedgerTotals, OrderCreation, OrderFilter,
    OrderRecompute, RefundEvent, RefundOutcome, Settlement,
};

const ORDER_COLUMNS: &str = "id, target, quantity, delivered, failed_permanent, remains, \
     refund_amount, status, account_id, unit_price, charged, idempotency_key, failure_reason, \
     created_at, started_at, completed_at";

const UNIT_COLUMNS: &str = "u.id, u.order_id, u.executor_identity, u.status, u.retry_count, \
     u.max_retries, u.created_at, u.started_at, u.completed_at, u.assigned_node, \
     u.failure_reason, u.refunded, u.settled";

/// SQLite-backed ledger store.
pub struct SqliteLedgerStore {
    conn: Mutex<Connection>,
}

impl SqliteLedgerStore {
    /// Open (or create) a ledger database file.
    pub fn new(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::from_connection(conn)
    }

    /// Create an in-memory ledger (useful for testing).
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), LedgerError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                balance INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                target TEXT NOT NULL,
                quantity INTEGER NOT NULL CHECK (quantity > 0),
                delivered INTEGER NOT NULL DEFAULT 0,
                failed_permanent INTEGER NOT NULL DEFAULT 0,
                remains INTEGER NOT NULL,
                refund_amount INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                account_id TEXT REFERENCES accounts(id),
                unit_price INTEGER NOT NULL DEFAULT 0,
                charged INTEGER NOT NULL DEFAULT 0,
                idempotency_key TEXT UNIQUE,
                failure_reason TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS units (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
                executor_identity TEXT NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                assigned_node TEXT,
                failure_reason TEXT,
                refunded INTEGER NOT NULL DEFAULT 0,
                settled INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS refund_events (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
                unit_id TEXT NOT NULL UNIQUE,
                account_id TEXT NOT NULL,
                units INTEGER NOT NULL,
                unit_price INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
            CREATE INDEX IF NOT EXISTS idx_orders_account ON orders(account_id);
            CREATE INDEX IF NOT EXISTS idx_units_order ON units(order_id);
            CREATE INDEX IF NOT EXISTS idx_units_status_created ON units(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_refund_events_order ON refund_events(order_id);
            "#,
        )?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn
            .lock()
            .map_err(|_| LedgerError::Database("ledger connection mutex poisoned".to_string()))
    }

    fn build_where_clause(filter: &OrderFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push("status = ?");
            params.push(Box::new(status.as_str()));
        }

        if let Some(ref account_id) = filter.account_id {
            conditions.push("account_id = ?");
            params.push(Box::new(account_id.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }
}

// ============================================================================
// Row mapping
// ============================================================================

/// Timestamps are stored with a fixed width so that text comparison orders them.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn parse_ts(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("invalid timestamp {:?}: {}", value, e)))
}

fn parse_opt_ts(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(idx, &v)).transpose()
}

fn row_to_order(row: &rusqlite::Row) -> rusqlite::Result<Order> {
    let status_str: String = row.get(7)?;
    let status = OrderStatus::parse(&status_str)
        .ok_or_else(|| conversion_error(7, format!("unknown order status {:?}", status_str)))?;
    let created_at: String = row.get(13)?;

    Ok(Order {
        id: row.get(0)?,
        target: row.get(1)?,
        quantity: row.get(2)?,
        delivered: row.get(3)?,
        failed_permanent: row.get(4)?,
        remains: row.get(5)?,
        refund_amount: from_minor_units(row.get(6)?),
        status,
        account_id: row.get(8)?,
        unit_price: from_minor_units(row.get(9)?),
        charged: from_minor_units(row.get(10)?),
        idempotency_key: row.get(11)?,
        failure_reason: row.get(12)?,
        created_at: parse_ts(13, &created_at)?,
        started_at: parse_opt_ts(14, row.get(14)?)?,
        completed_at: parse_opt_ts(15, row.get(15)?)?,
    })
}

fn row_to_unit(row: &rusqlite::Row) -> rusqlite::Result<Unit> {
    let status_str: String = row.get(3)?;
    let status = UnitStatus::parse(&status_str)
        .ok_or_else(|| conversion_error(3, format!("unknown unit status {:?}", status_str)))?;
    let created_at: String = row.get(6)?;

    Ok(Unit {
        id: row.get(0)?,
        order_id: row.get(1)?,
        executor_identity: row.get(2)?,
        status,
        retry_count: row.get(4)?,
        max_retries: row.get(5)?,
        created_at: parse_ts(6, &created_at)?,
        started_at: parse_opt_ts(7, row.get(7)?)?,
        completed_at: parse_opt_ts(8, row.get(8)?)?,
        assigned_node: row.get(9)?,
        failure_reason: row.get(10)?,
        refunded: row.get(11)?,
        settled: row.get(12)?,
    })
}

fn query_order(conn: &Connection, order_id: &str) -> Result<Option<Order>, LedgerError> {
    let sql = format!("SELECT {} FROM orders WHERE id = ?1", ORDER_COLUMNS);
    Ok(conn
        .query_row(&sql, params![order_id], row_to_order)
        .optional()?)
}

fn query_unit(conn: &Connection, unit_id: &str) -> Result<Option<Unit>, LedgerError> {
    let sql = format!("SELECT {} FROM units u WHERE u.id = ?1", UNIT_COLUMNS);
    Ok(conn.query_row(&sql, params![unit_id], row_to_unit).optional()?)
}

// ============================================================================
// Atomic ledger statements
// ============================================================================

fn increment_delivered_on(conn: &Connection, order_id: &str, n: u32) -> Result<(), LedgerError> {
    let updated = conn.execute(
        "UPDATE orders SET delivered = delivered + ?1, \
         remains = MAX(0, quantity - (delivered + ?1) - failed_permanent), updated_at = ?2 \
         WHERE id = ?3",
        params![n, ts(&Utc::now()), order_id],
    )?;
    if updated == 0 {
        return Err(LedgerError::OrderNotFound(order_id.to_string()));
    }
    debug!(order_id, n, "Order delivered incremented");
    Ok(())
}

fn increment_failed_on(conn: &Connection, order_id: &str, n: u32) -> Result<(), LedgerError> {
    let updated = conn.execute(
        "UPDATE orders SET failed_permanent = failed_permanent + ?1, \
         remains = MAX(0, quantity - delivered - (failed_permanent + ?1)), updated_at = ?2 \
         WHERE id = ?3",
        params![n, ts(&Utc::now()), order_id],
    )?;
    if updated == 0 {
        return Err(LedgerError::OrderNotFound(order_id.to_string()));
    }
    debug!(order_id, n, "Order failed_permanent incremented");
    Ok(())
}

fn increment_refund_on(conn: &Connection, order_id: &str, minor: i64) -> Result<(), LedgerError> {
    let updated = conn.execute(
        "UPDATE orders SET refund_amount = refund_amount + ?1, updated_at = ?2 WHERE id = ?3",
        params![minor, ts(&Utc::now()), order_id],
    )?;
    if updated == 0 {
        return Err(LedgerError::OrderNotFound(order_id.to_string()));
    }
    Ok(())
}

fn credit_on(conn: &Connection, account_id: &str, minor: i64) -> Result<(), LedgerError> {
    let updated = conn.execute(
        "UPDATE accounts SET balance = balance + ?1 WHERE id = ?2",
        params![minor, account_id],
    )?;
    if updated == 0 {
        return Err(LedgerError::AccountNotFound(account_id.to_string()));
    }
    Ok(())
}

/// Gate first, then credit. Must run inside a transaction.
fn refund_on(
    conn: &Connection,
    unit_id: &str,
    order_id: &str,
    account_id: &str,
    failed_units: u32,
    unit_price: Decimal,
) -> Result<RefundOutcome, LedgerError> {
    let gate = conn.execute(
        "UPDATE units SET refunded = 1 WHERE id = ?1 AND order_id = ?2 AND refunded = 0",
        params![unit_id, order_id],
    )?;

    if gate == 0 {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM units WHERE id = ?1 AND order_id = ?2)",
            params![unit_id, order_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(LedgerError::UnitNotFound(unit_id.to_string()));
        }
        debug!(unit_id, order_id, "Refund skipped, unit already refunded");
        return Ok(RefundOutcome {
            unit_id: unit_id.to_string(),
            order_id: order_id.to_string(),
            account_id: account_id.to_string(),
            applied: false,
            amount: Decimal::ZERO,
            skip_reason: Some("already refunded".to_string()),
        });
    }

    let amount = line_amount(unit_price, failed_units)?;
    let minor = to_minor_units(amount)?;
    credit_on(conn, account_id, minor)?;
    increment_refund_on(conn, order_id, minor)?;
    conn.execute(
        "INSERT INTO refund_events (id, order_id, unit_id, account_id, units, unit_price, amount, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            uuid::Uuid::new_v4().to_string(),
            order_id,
            unit_id,
            account_id,
            failed_units,
            to_minor_units(unit_price)?,
            minor,
            ts(&Utc::now()),
        ],
    )?;

    info!(unit_id, order_id, account_id, %amount, "Refund applied");

    Ok(RefundOutcome {
        unit_id: unit_id.to_string(),
        order_id: order_id.to_string(),
        account_id: account_id.to_string(),
        applied: true,
        amount,
        skip_reason: None,
    })
}

impl LedgerStore for SqliteLedgerStore {
    fn open_account(
        &self,
        account_id: &str,
        initial_balance: Decimal,
    ) -> Result<Account, LedgerError> {
        let conn = self.conn()?;

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM accounts WHERE id = ?1)",
            params![account_id],
            |row| row.get(0),
        )?;
        if exists {
            return Err(LedgerError::AccountExists(account_id.to_string()));
        }

        let now = Utc::now();
        let minor = to_minor_units(initial_balance)?;
        conn.execute(
            "INSERT INTO accounts (id, balance, created_at) VALUES (?1, ?2, ?3)",
            params![account_id, minor, ts(&now)],
        )?;

        Ok(Account {
            id: account_id.to_string(),
            balance: from_minor_units(minor),
            created_at: now,
        })
    }

    fn get_account(&self, account_id: &str) -> Result<Option<Account>, LedgerError> {
        let conn = self.conn()?;

        let account = conn
            .query_row(
                "SELECT id, balance, created_at FROM accounts WHERE id = ?1",
                params![account_id],
                |row| {
                    let created_at: String = row.get(2)?;
                    Ok(Account {
                        id: row.get(0)?,
                        balance: from_minor_units(row.get(1)?),
                        created_at: parse_ts(2, &created_at)?,
                    })
                },
            )
            .optional()?;

        Ok(account)
    }

    fn create_order(
        &self,
        mut order: Order,
        units: Vec<Unit>,
    ) -> Result<OrderCreation, LedgerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if let Some(ref key) = order.idempotency_key {
            let sql = format!("SELECT {} FROM orders WHERE idempotency_key = ?1", ORDER_COLUMNS);
            let existing = tx.query_row(&sql, params![key], row_to_order).optional()?;
            if let Some(existing) = existing {
                info!(
                    order_id = %existing.id,
                    idempotency_key = %key,
                    "Duplicate order creation, returning existing order"
                );
                return Ok(OrderCreation::Existing(existing));
            }
        }

        if let Some(ref account_id) = order.account_id {
            let charged = to_minor_units(order.charged)?;
            let debited = tx.execute(
                "UPDATE accounts SET balance = balance - ?1 WHERE id = ?2 AND balance >= ?1",
                params![charged, account_id],
            )?;
            if debited == 0 {
                let available: Option<i64> = tx
                    .query_row(
                        "SELECT balance FROM accounts WHERE id = ?1",
                        params![account_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                return Err(match available {
                    None => LedgerError::AccountNotFound(account_id.clone()),
                    Some(balance) => LedgerError::InsufficientBalance {
                        account_id: account_id.clone(),
                        required: order.charged,
                        available: from_minor_units(balance),
                    },
                });
            }
        }

        order.status = OrderStatus::Pending;
        let created_at = ts(&order.created_at);
        tx.execute(
            "INSERT INTO orders (id, target, quantity, delivered, failed_permanent, remains, \
             refund_amount, status, account_id, unit_price, charged, idempotency_key, \
             failure_reason, created_at, started_at, completed_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, NULL, NULL, ?14)",
            params![
                order.id,
                order.target,
                order.quantity,
                order.delivered,
                order.failed_permanent,
                order.remains,
                to_minor_units(order.refund_amount)?,
                order.status.as_str(),
                order.account_id,
                to_minor_units(order.unit_price)?,
                to_minor_units(order.charged)?,
                order.idempotency_key,
                order.failure_reason,
                created_at,
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO units (id, order_id, executor_identity, status, retry_count, \
                 max_retries, created_at, refunded, settled) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0)",
            )?;
            for unit in &units {
                stmt.execute(params![
                    unit.id,
                    order.id,
                    unit.executor_identity,
                    UnitStatus::Pending.as_str(),
                    unit.retry_count,
                    unit.max_retries,
                    ts(&unit.created_at),
                ])?;
            }
        }

        tx.execute(
            "UPDATE orders SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![OrderStatus::Active.as_str(), ts(&Utc::now()), order.id],
        )?;

        tx.commit()?;

        order.status = OrderStatus::Active;
        info!(
            order_id = %order.id,
            quantity = order.quantity,
            charged = %order.charged,
            "Order created"
        );

        Ok(OrderCreation::Created(order))
    }

    fn get_order(&self, order_id: &str) -> Result<Option<Order>, LedgerError> {
        let conn = self.conn()?;
        query_order(&conn, order_id)
    }

    fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, LedgerError> {
        let conn = self.conn()?;

        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!(
            "SELECT {} FROM orders {} ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?",
            ORDER_COLUMNS, where_clause
        );

        let mut all_params: Vec<Box<dyn rusqlite::ToSql>> = params;
        all_params.push(Box::new(filter.limit));
        all_params.push(Box::new(filter.offset));
        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&sql)?;
        let orders = stmt
            .query_map(param_refs.as_slice(), row_to_order)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(orders)
    }

    fn count_orders(&self, filter: &OrderFilter) -> Result<i64, LedgerError> {
        let conn = self.conn()?;

        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM orders {}", where_clause);
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let count: i64 = conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))?;
        Ok(count)
    }

    fn get_unit(&self, unit_id: &str) -> Result<Option<Unit>, LedgerError> {
        let conn = self.conn()?;
        query_unit(&conn, unit_id)
    }

    fn list_units(&self, order_id: &str) -> Result<Vec<Unit>, LedgerError> {
        let conn = self.conn()?;

        let sql = format!(
            "SELECT {} FROM units u WHERE u.order_id = ?1 ORDER BY u.rowid ASC",
            UNIT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let units = stmt
            .query_map(params![order_id], row_to_unit)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(units)
    }

    fn fetch_pending_units(&self, limit: usize) -> Result<Vec<Unit>, LedgerError> {
        let conn = self.conn()?;

        let sql = format!(
            "SELECT {} FROM units u JOIN orders o ON o.id = u.order_id \
             WHERE u.status = 'pending' AND o.status IN ('active', 'delivering') \
             ORDER BY u.created_at ASC, u.rowid ASC LIMIT ?1",
            UNIT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let units = stmt
            .query_map(params![limit as i64], row_to_unit)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(units)
    }

    fn find_stuck_units(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Unit>, LedgerError> {
        let conn = self.conn()?;

        let sql = format!(
            "SELECT {} FROM units u \
             WHERE u.status = 'executing' AND u.started_at < ?1 \
             ORDER BY u.started_at ASC LIMIT ?2",
            UNIT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let units = stmt
            .query_map(params![ts(&started_before), limit as i64], row_to_unit)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(units)
    }

    fn transition_unit(&self, unit: &Unit, expected: UnitStatus) -> Result<(), LedgerError> {
        if !expected.can_transition_to(unit.status) {
            return Err(LedgerError::InvalidState {
                entity: "unit",
                id: unit.id.clone(),
                current: expected.to_string(),
                operation: format!("move to {}", unit.status),
            });
        }

        // Claims and requeues re-check the order inside the update so a
        // concurrent cancel cannot slip between the read and the write.
        let guard = match unit.status {
            UnitStatus::Executing => {
                " AND refunded = 0 AND EXISTS (SELECT 1 FROM orders o \
                 WHERE o.id = units.order_id AND o.status IN ('active', 'delivering'))"
            }
            UnitStatus::Pending => {
                " AND EXISTS (SELECT 1 FROM orders o \
                 WHERE o.id = units.order_id AND o.status IN ('active', 'delivering'))"
            }
            _ => "",
        };
        let sql = format!(
            "UPDATE units SET status = ?1, retry_count = ?2, started_at = ?3, completed_at = ?4, \
             assigned_node = ?5, failure_reason = ?6 WHERE id = ?7 AND status = ?8{}",
            guard
        );

        let conn = self.conn()?;

        let updated = conn.execute(
            &sql,
            params![
                unit.status.as_str(),
                unit.retry_count,
                unit.started_at.as_ref().map(ts),
                unit.completed_at.as_ref().map(ts),
                unit.assigned_node,
                unit.failure_reason,
                unit.id,
                expected.as_str(),
            ],
        )?;

        if updated == 0 {
            let current: Option<(String, String, String)> = conn
                .query_row(
                    "SELECT u.status, u.order_id, o.status FROM units u \
                     JOIN orders o ON o.id = u.order_id WHERE u.id = ?1",
                    params![unit.id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            return Err(match current {
                None => LedgerError::UnitNotFound(unit.id.clone()),
                Some((current, order_id, order_status))
                    if !guard.is_empty()
                        && current == expected.as_str()
                        && !matches!(order_status.as_str(), "active" | "delivering") =>
                {
                    LedgerError::OrderClosed {
                        order_id,
                        status: order_status,
                    }
                }
                Some((current, _, _)) => LedgerError::InvalidState {
                    entity: "unit",
                    id: unit.id.clone(),
                    current,
                    operation: format!("move to {}", unit.status),
                },
            });
        }

        Ok(())
    }

    fn mark_order_delivering(&self, order_id: &str, at: DateTime<Utc>) -> Result<(), LedgerError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE orders SET status = 'delivering', started_at = COALESCE(started_at, ?1), \
             updated_at = ?1 WHERE id = ?2 AND status = 'active'",
            params![ts(&at), order_id],
        )?;
        Ok(())
    }

    fn recompute_order_status(&self, order_id: &str) -> Result<OrderRecompute, LedgerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let order = query_order(&tx, order_id)?
            .ok_or_else(|| LedgerError::OrderNotFound(order_id.to_string()))?;
        let previous_status = order.status;
        if order.status.is_terminal() {
            return Ok(OrderRecompute {
                order,
                previous_status,
            });
        }

        // Only settled units count as finished, so a terminal order always has
        // its counters and refunds fully applied.
        let (total, terminal, failed): (i64, i64, i64) = tx.query_row(
            "SELECT COUNT(*), \
             COALESCE(SUM(CASE WHEN settled = 1 THEN 1 ELSE 0 END), 0), \
             COALESCE(SUM(CASE WHEN settled = 1 AND status = 'failed' THEN 1 ELSE 0 END), 0) \
             FROM units WHERE order_id = ?1",
            params![order_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        if total == 0 {
            return Ok(OrderRecompute {
                order,
                previous_status,
            });
        }

        let now = ts(&Utc::now());
        if terminal < total {
            tx.execute(
                "UPDATE orders SET status = 'delivering', started_at = COALESCE(started_at, ?1), \
                 updated_at = ?1 WHERE id = ?2 AND status IN ('pending', 'active')",
                params![now, order_id],
            )?;
        } else if failed > 0 {
            let reason = format!("{} of {} units failed permanently", failed, total);
            tx.execute(
                "UPDATE orders SET status = 'failed', completed_at = ?1, failure_reason = ?2, \
                 updated_at = ?1 WHERE id = ?3 AND status NOT IN ('completed', 'failed', 'cancelled')",
                params![now, reason, order_id],
            )?;
        } else {
            tx.execute(
                "UPDATE orders SET status = 'completed', completed_at = ?1, updated_at = ?1 \
                 WHERE id = ?2 AND status NOT IN ('completed', 'failed', 'cancelled')",
                params![now, order_id],
            )?;
        }

        let order = query_order(&tx, order_id)?
            .ok_or_else(|| LedgerError::OrderNotFound(order_id.to_string()))?;
        tx.commit()?;

        Ok(OrderRecompute {
            order,
            previous_status,
        })
    }

    fn cancel_order(&self, order_id: &str, reason: &str) -> Result<Cancellation, LedgerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let order = query_order(&tx, order_id)?
            .ok_or_else(|| LedgerError::OrderNotFound(order_id.to_string()))?;
        if !order.status.can_cancel() {
            return Err(LedgerError::InvalidState {
                entity: "order",
                id: order_id.to_string(),
                current: order.status.to_string(),
                operation: "cancel".to_string(),
            });
        }

        let now = ts(&Utc::now());
        tx.execute(
            "UPDATE orders SET status = 'cancelled', completed_at = ?1, failure_reason = ?2, \
             updated_at = ?1 WHERE id = ?3",
            params![now, reason, order_id],
        )?;

        let mut refunds = Vec::new();
        if let Some(ref account_id) = order.account_id {
            let pending: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM units WHERE order_id = ?1 AND status = 'pending' \
                     AND refunded = 0 ORDER BY rowid ASC",
                )?;
                let ids = stmt
                    .query_map(params![order_id], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                ids
            };
            for unit_id in pending {
                refunds.push(refund_on(
                    &tx,
                    &unit_id,
                    order_id,
                    account_id,
                    1,
                    order.unit_price,
                )?);
            }
        }

        let order = query_order(&tx, order_id)?
            .ok_or_else(|| LedgerError::OrderNotFound(order_id.to_string()))?;
        tx.commit()?;

        info!(
            order_id,
            refunded_units = refunds.len(),
            "Order cancelled"
        );

        Ok(Cancellation { order, refunds })
    }

    fn increment_delivered(&self, order_id: &str, n: u32) -> Result<(), LedgerError> {
        let conn = self.conn()?;
        increment_delivered_on(&conn, order_id, n)
    }

    fn increment_failed_permanent(&self, order_id: &str, n: u32) -> Result<(), LedgerError> {
        let conn = self.conn()?;
        increment_failed_on(&conn, order_id, n)
    }

    fn increment_order_refund(&self, order_id: &str, amount: Decimal) -> Result<(), LedgerError> {
        let conn = self.conn()?;
        increment_refund_on(&conn, order_id, to_minor_units(amount)?)
    }

    fn credit_account_balance(
        &self,
        account_id: &str,
        amount: Decimal,
    ) -> Result<(), LedgerError> {
        let conn = self.conn()?;
        credit_on(&conn, account_id, to_minor_units(amount)?)
    }

    fn process_refund(
        &self,
        unit_id: &str,
        order_id: &str,
        account_id: &str,
        failed_units: u32,
        unit_price: Decimal,
    ) -> Result<RefundOutcome, LedgerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let outcome = refund_on(&tx, unit_id, order_id, account_id, failed_units, unit_price)?;
        tx.commit()?;
        Ok(outcome)
    }

    fn settle_unit(&self, unit_id: &str) -> Result<Settlement, LedgerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let unit = query_unit(&tx, unit_id)?
            .ok_or_else(|| LedgerError::UnitNotFound(unit_id.to_string()))?;
        if !unit.status.is_terminal() {
            return Err(LedgerError::InvalidState {
                entity: "unit",
                id: unit_id.to_string(),
                current: unit.status.to_string(),
                operation: "settle".to_string(),
            });
        }

        let gate = tx.execute(
            "UPDATE units SET settled = 1 WHERE id = ?1 AND settled = 0",
            params![unit_id],
        )?;
        if gate == 0 {
            return Ok(Settlement {
                unit_id: unit.id,
                order_id: unit.order_id,
                unit_status: unit.status,
                applied: false,
                refund: None,
            });
        }

        let order = query_order(&tx, &unit.order_id)?
            .ok_or_else(|| LedgerError::OrderNotFound(unit.order_id.clone()))?;

        let refund = if unit.status == UnitStatus::Completed {
            increment_delivered_on(&tx, &order.id, 1)?;
            None
        } else {
            increment_failed_on(&tx, &order.id, 1)?;
            match order.account_id {
                Some(ref account_id) => Some(refund_on(
                    &tx,
                    &unit.id,
                    &order.id,
                    account_id,
                    1,
                    order.unit_price,
                )?),
                None => None,
            }
        };

        tx.commit()?;

        Ok(Settlement {
            unit_id: unit.id,
            order_id: unit.order_id,
            unit_status: unit.status,
            applied: true,
            refund,
        })
    }

    fn list_refund_events(&self, order_id: &str) -> Result<Vec<RefundEvent>, LedgerError> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, order_id, unit_id, account_id, units, unit_price, amount, created_at \
             FROM refund_events WHERE order_id = ?1 ORDER BY rowid ASC",
        )?;
        let events = stmt
            .query_map(params![order_id], |row| {
                let created_at: String = row.get(7)?;
                Ok(RefundEvent {
                    id: row.get(0)?,
                    order_id: row.get(1)?,
                    unit_id: row.get(2)?,
                    account_id: row.get(3)?,
                    units: row.get(4)?,
                    unit_price: from_minor_units(row.get(5)?),
                    amount: from_minor_units(row.get(6)?),
                    created_at: parse_ts(7, &created_at)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(events)
    }

    fn totals(&self) -> Result<LedgerTotals, LedgerError> {
        let conn = self.conn()?;
        let mut totals = LedgerTotals::default();

        {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM orders GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                if let Some(status) = OrderStatus::parse(&status) {
                    totals.orders_by_status.insert(status, count);
                }
            }
        }

        {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM units GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                if let Some(status) = UnitStatus::parse(&status) {
                    totals.units_by_status.insert(status, count);
                }
            }
        }

        totals.average_retries = conn.query_row(
            "SELECT COALESCE(AVG(retry_count), 0.0) FROM units",
            [],
            |row| row.get(0),
        )?;

        let (delivered, failed, refunded): (i64, i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(delivered), 0), COALESCE(SUM(failed_permanent), 0), \
             COALESCE(SUM(refund_amount), 0) FROM orders",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        totals.total_delivered = delivered;
        totals.total_failed_permanent = failed;
        totals.total_refunded = from_minor_units(refunded);

        Ok(totals)
    }
}
