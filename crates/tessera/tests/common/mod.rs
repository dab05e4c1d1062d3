//! In-memory connection answering single-table selects from a row store.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tessera::prelude::*;

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn unwrap_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

#[derive(Debug, Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

/// Tables plus a log of every statement received.
#[derive(Debug, Default)]
pub struct Store {
    tables: HashMap<String, Table>,
    pub queries: Vec<(String, Vec<Value>)>,
    pub executed: Vec<(String, Vec<Value>)>,
    /// Row count returned by the next update or delete.
    pub affected: Option<u64>,
}

impl Store {
    pub fn table(&mut self, name: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        self.tables.insert(
            name.to_string(),
            Table {
                columns: columns.iter().map(|c| (*c).to_string()).collect(),
                rows,
            },
        );
    }

    pub fn delete_row(&mut self, table: &str, id: &Value) {
        if let Some(t) = self.tables.get_mut(table) {
            t.rows.retain(|row| &row[0] != id);
        }
    }

    fn select(&self, sql: &str, params: &[Value]) -> Vec<Row> {
        let body = sql.strip_prefix("select ").expect("select statement");
        let body = body.strip_prefix("distinct ").unwrap_or(body);
        let (columns, rest) = body.split_once(" from ").expect("from clause");
        let name = rest.split_whitespace().next().expect("table name");
        let table = self.tables.get(name).expect("known table");
        let index = |column: &str| {
            let column = column.rsplit('.').next().unwrap_or(column);
            table
                .columns
                .iter()
                .position(|c| c == column)
                .expect("known column")
        };
        let wanted: Vec<usize> = columns.split(", ").map(index).collect();
        let filter = rest
            .split_once(" where ")
            .map(|(_, w)| index(w.split([' ', '=']).next().expect("filter column")));
        table
            .rows
            .iter()
            .filter(|row| filter.is_none_or(|i| params.iter().any(|p| p == &row[i])))
            .map(|row| Row::from_values(wanted.iter().map(|i| row[*i].clone()).collect()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct MockConnection {
    pub store: Arc<Mutex<Store>>,
}

impl MockConnection {
    pub fn new(store: Store) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    pub fn queries(&self) -> Vec<(String, Vec<Value>)> {
        self.store.lock().expect("lock poisoned").queries.clone()
    }

    pub fn executed(&self) -> Vec<(String, Vec<Value>)> {
        self.store.lock().expect("lock poisoned").executed.clone()
    }
}

impl Connection for MockConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let store = Arc::clone(&self.store);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = store.lock().expect("lock poisoned");
            guard.queries.push((sql.clone(), params.clone()));
            Outcome::Ok(guard.select(&sql, &params))
        }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let store = Arc::clone(&self.store);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = store.lock().expect("lock poisoned");
            guard.executed.push((sql, params));
            Outcome::Ok(guard.affected.take().unwrap_or(1))
        }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<(u64, Option<Value>), Error>> + Send {
        let store = Arc::clone(&self.store);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            store.lock().expect("lock poisoned").executed.push((sql, params));
            Outcome::Ok((1, None))
        }
    }
}

/// `Customer` and `Order` with a lazily referenced customer.
pub fn order_descriptors() -> DescriptorMap {
    DescriptorMap::build(vec![
        BeanDescriptor::builder("Customer")
            .table("customer")
            .property(BeanProperty::scalar("id", "id", SqlType::BigInt).id())
            .property(BeanProperty::scalar("name", "name", SqlType::VarChar(40)))
            .property(BeanProperty::scalar("email", "email", SqlType::VarChar(80)))
            .property(BeanProperty::scalar("version", "version", SqlType::BigInt).version()),
        BeanDescriptor::builder("Order")
            .table("orders")
            .property(BeanProperty::scalar("id", "id", SqlType::BigInt).id())
            .property(BeanProperty::scalar("status", "status", SqlType::VarChar(10)))
            .property(BeanProperty::one("customer", "Customer")),
    ])
    .expect("valid descriptors")
}

/// `count` orders, each with its own customer.
pub fn order_store(count: i64) -> Store {
    let mut store = Store::default();
    store.table(
        "customer",
        &["id", "name", "email", "version"],
        (1..=count)
            .map(|i| {
                vec![
                    Value::BigInt(i),
                    text(&format!("customer-{i}")),
                    Value::Null,
                    Value::BigInt(1),
                ]
            })
            .collect(),
    );
    store.table(
        "orders",
        &["id", "status", "customer_id"],
        (1..=count)
            .map(|i| vec![Value::BigInt(100 + i), text("NEW"), Value::BigInt(i)])
            .collect(),
    );
    store
}

pub fn one(value: PropertyValue) -> BeanRef {
    match value {
        PropertyValue::One(Some(bean)) => bean,
        other => panic!("expected a bean, got {other:?}"),
    }
}

pub fn scalar(bean: &BeanRef, name: &str) -> Value {
    read_bean(bean)
        .scalar(name)
        .expect("known property")
        .cloned()
        .expect("loaded property")
}
