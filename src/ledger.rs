//! In-memory catalog, orders and payments.
//!
//! Writes go through [`Ledger::stage`]: they are collected while the closure
//! runs and held as [`StagedWrites`], which keep the ledger locked until they
//! are applied or dropped. Dropping them discards every write.

use crate::model::{Order, Payment, Product};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
struct LedgerData {
    products: HashMap<String, Product>,
    orders: HashMap<String, Order>,
    payments: HashMap<String, Payment>,
}

#[derive(Debug, Default)]
pub struct Ledger {
    data: Arc<Mutex<LedgerData>>,
}

pub struct LedgerTx<'a> {
    committed: &'a LedgerData,
    orders: HashMap<String, Order>,
    payments: HashMap<String, Payment>,
}

impl LedgerTx<'_> {
    pub fn product(&self, id: &str) -> Option<Product> {
        self.committed.products.get(id).cloned()
    }

    pub fn order(&self, id: &str) -> Option<Order> {
        self.orders
            .get(id)
            .or_else(|| self.committed.orders.get(id))
            .cloned()
    }

    pub fn find_payment<P>(&self, predicate: P) -> Option<Payment>
    where
        P: Fn(&Payment) -> bool,
    {
        self.payments
            .values()
            .find(|payment| predicate(*payment))
            .or_else(|| {
                self.committed
                    .payments
                    .values()
                    .filter(|payment| !self.payments.contains_key(&payment.id))
                    .find(|payment| predicate(*payment))
            })
            .cloned()
    }

    pub fn put_order(&mut self, order: Order) {
        self.orders.insert(order.id.clone(), order);
    }

    pub fn put_payment(&mut self, payment: Payment) {
        self.payments.insert(payment.id.clone(), payment);
    }
}

/// Writes of a successful transaction that are not visible yet.
pub struct StagedWrites {
    guard: OwnedMutexGuard<LedgerData>,
    orders: HashMap<String, Order>,
    payments: HashMap<String, Payment>,
}

impl StagedWrites {
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty() && self.payments.is_empty()
    }

    /// Makes every staged write visible and unlocks the ledger.
    pub fn apply(self) {
        let StagedWrites {
            mut guard,
            orders,
            payments,
        } = self;
        guard.orders.extend(orders);
        guard.payments.extend(payments);
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_products(products: impl IntoIterator<Item = Product>) -> Self {
        let data = LedgerData {
            products: products
                .into_iter()
                .map(|product| (product.id.clone(), product))
                .collect(),
            ..LedgerData::default()
        };
        Self {
            data: Arc::new(Mutex::new(data)),
        }
    }

    /// Ledger preloaded with the default catalog.
    pub fn seeded(now: DateTime<Utc>) -> Self {
        let catalog = [
            ("p1", "Plano Premium", 19_900),
            ("p2", "Plano Starter", 9_900),
            ("p3", "Pack Moedas 1k", 4_900),
        ];
        Self::with_products(catalog.into_iter().map(|(id, name, price_cents)| Product {
            id: id.to_string(),
            name: name.to_string(),
            price_cents,
            seller: "Santa Group Store".to_string(),
            created_at: now,
        }))
    }

    /// Newest first.
    pub async fn list_products(&self) -> Vec<Product> {
        let data = self.data.lock().await;
        let mut products = data.products.values().cloned().collect::<Vec<_>>();
        products.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        products
    }

    pub async fn product(&self, id: &str) -> Option<Product> {
        self.data.lock().await.products.get(id).cloned()
    }

    pub async fn order(&self, id: &str) -> Option<Order> {
        self.data.lock().await.orders.get(id).cloned()
    }

    /// Payments of an order, newest first.
    pub async fn payments_for_order(&self, order_id: &str) -> Vec<Payment> {
        let data = self.data.lock().await;
        let mut payments = data
            .payments
            .values()
            .filter(|payment| payment.order_id == order_id)
            .cloned()
            .collect::<Vec<_>>();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        payments
    }

    pub async fn order_count(&self) -> usize {
        self.data.lock().await.orders.len()
    }

    pub async fn payment_count(&self) -> usize {
        self.data.lock().await.payments.len()
    }

    /// Runs `work` against a consistent view and returns its writes unapplied.
    ///
    /// The ledger stays locked until the returned [`StagedWrites`] is applied
    /// or dropped, so staged transactions are serialized. Nothing is staged
    /// when the closure returns `Err`.
    pub async fn stage<T, E, F>(&self, work: F) -> Result<(T, StagedWrites), E>
    where
        F: FnOnce(&mut LedgerTx<'_>) -> Result<T, E>,
    {
        let guard = Arc::clone(&self.data).lock_owned().await;
        let mut tx = LedgerTx {
            committed: &*guard,
            orders: HashMap::new(),
            payments: HashMap::new(),
        };
        let value = work(&mut tx)?;
        let LedgerTx {
            orders, payments, ..
        } = tx;
        Ok((
            value,
            StagedWrites {
                guard,
                orders,
                payments,
            },
        ))
    }

    /// Stages and immediately applies `work`.
    pub async fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut LedgerTx<'_>) -> Result<T, E>,
    {
        let (value, staged) = self.stage(work).await?;
        staged.apply();
        Ok(value)
    }
}
