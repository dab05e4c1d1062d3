mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{
    MockConnection, Store, one, order_descriptors, order_store, scalar, text, unwrap_err,
    unwrap_outcome,
};
use tessera::prelude::*;

fn lazy_orders() -> Query {
    Query::new("Order")
        .select(&["status"])
        .fetch("customer", &[], FetchConfig::lazy(10))
}

#[test]
fn fifteen_orders_load_customers_in_two_batches() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = MockConnection::new(order_store(15));
        let database = Arc::new(Database::new(order_descriptors()));
        let mut session = database.session(conn.clone());

        let orders = unwrap_outcome(session.find_list(&cx, &lazy_orders()).await);
        assert_eq!(orders.len(), 15);
        assert_eq!(
            conn.queries()[0].0,
            "select o.id, o.status, o.customer_id from orders o"
        );

        for (i, order) in orders.iter().enumerate() {
            let customer = one(unwrap_outcome(session.get(&cx, order, "customer").await));
            let name = unwrap_outcome(session.get(&cx, &customer, "name").await);
            assert_eq!(name.as_value(), Some(&text(&format!("customer-{}", i + 1))));
        }

        let queries = conn.queries();
        assert_eq!(queries.len(), 3, "{queries:#?}");
        let first: Vec<Value> = (1..=10).map(Value::BigInt).collect();
        assert_eq!(queries[1].1, first);
        // the second batch repeats its last id up to the batch size
        assert_eq!(queries[1].0, queries[2].0);
        assert_eq!(&queries[2].1[..5], &(11..=15).map(Value::BigInt).collect::<Vec<_>>()[..]);
        assert!(queries[2].1[5..].iter().all(|v| v == &Value::BigInt(15)));
        assert_eq!(session.pending_loads(), 0);
    });
}

#[test]
fn vanished_row_fails_only_its_own_reference() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = MockConnection::new(order_store(4));
        let database = Arc::new(Database::new(order_descriptors()));
        let mut session = database.session(conn.clone());

        let orders = unwrap_outcome(session.find_list(&cx, &lazy_orders()).await);
        let customers: Vec<BeanRef> = orders
            .iter()
            .map(|o| one(read_bean(o).get("customer").expect("property").clone()))
            .collect();

        conn.store
            .lock()
            .expect("lock poisoned")
            .delete_row("customer", &Value::BigInt(3));

        // loads the whole batch, including the vanished row
        let name = unwrap_outcome(session.get(&cx, &customers[1], "name").await);
        assert_eq!(name.as_value(), Some(&text("customer-2")));
        assert_eq!(scalar(&customers[3], "name"), text("customer-4"));

        let err = unwrap_err(session.get(&cx, &customers[2], "name").await);
        match err {
            Error::EntityNotFound(e) => {
                assert_eq!(e.entity, "Customer");
                assert_eq!(e.id, "3");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(read_bean(&customers[0]).state(), BeanState::Loaded);
        assert_eq!(conn.queries().len(), 2);
    });
}

#[test]
fn self_referencing_managers_share_instances() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    let descriptors = DescriptorMap::build(vec![
        BeanDescriptor::builder("Employee")
            .table("employee")
            .property(BeanProperty::scalar("id", "id", SqlType::BigInt).id())
            .property(BeanProperty::scalar("name", "name", SqlType::VarChar(40)))
            .property(BeanProperty::one("manager", "Employee")),
    ])
    .expect("valid descriptors");
    let mut store = Store::default();
    store.table(
        "employee",
        &["id", "name", "manager_id"],
        vec![
            vec![Value::BigInt(1), text("Ada"), Value::Null],
            vec![Value::BigInt(2), text("Ben"), Value::BigInt(1)],
            vec![Value::BigInt(3), text("Cal"), Value::BigInt(2)],
        ],
    );

    rt.block_on(async {
        let conn = MockConnection::new(store);
        let database = Arc::new(Database::new(descriptors));
        let mut session = database.session(conn.clone());

        let staff = unwrap_outcome(session.find_list(&cx, &Query::new("Employee")).await);
        let cal = &staff[2];
        let ben = one(unwrap_outcome(session.get(&cx, cal, "manager").await));
        let ada = one(unwrap_outcome(session.get(&cx, &ben, "manager").await));
        assert!(Arc::ptr_eq(&ben, &staff[1]));
        assert!(Arc::ptr_eq(&ada, &staff[0]));

        let top = unwrap_outcome(session.get(&cx, &ada, "manager").await);
        assert!(top.is_null());
        assert_eq!(conn.queries().len(), 1);
    });
}

#[test]
fn commit_ends_the_unit_of_work() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = MockConnection::new(order_store(3));
        let database = Arc::new(Database::new(order_descriptors()));
        let mut session = database.session(conn.clone());

        let first = unwrap_outcome(session.find_by_id(&cx, "Order", 101i64).await)
            .expect("order 101");
        session.commit();
        assert!(session.persistence_context().is_empty());

        let again = unwrap_outcome(session.find_by_id(&cx, "Order", 101i64).await)
            .expect("order 101");
        assert!(!Arc::ptr_eq(&first, &again));
        assert_eq!(conn.queries().len(), 2);
    });
}
