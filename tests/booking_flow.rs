use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use bookd::tenant::TenantManager;
use bookd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir: PathBuf = std::env::temp_dir().join(format!("bookd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "bookd".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr, user: &str, db: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user(user)
        .password("bookd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// Collect the data rows of a simple-protocol SELECT.
async fn query_rows(
    client: &tokio_postgres::Client,
    sql: &str,
) -> Vec<tokio_postgres::SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn is_true(field: Option<&str>) -> bool {
    matches!(field, Some("t") | Some("true"))
}

struct Salon {
    business: Ulid,
    service: Ulid,
}

/// Register a business with a 30-minute service, open Mondays
/// 09:00–18:00.
async fn seed_salon(owner: &tokio_postgres::Client) -> Salon {
    let business = Ulid::new();
    let service = Ulid::new();
    owner
        .batch_execute(&format!(
            "INSERT INTO businesses (id, name) VALUES ('{business}', 'Corte Fino')"
        ))
        .await
        .unwrap();
    owner
        .batch_execute(&format!(
            "INSERT INTO services (id, business_id, duration_minutes, price_cents) VALUES ('{service}', '{business}', 30, 5000)"
        ))
        .await
        .unwrap();
    owner
        .batch_execute(&format!(
            "INSERT INTO working_hours (business_id, weekday, start_minute, end_minute, active) VALUES ('{business}', 1, 540, 1080, true)"
        ))
        .await
        .unwrap();
    Salon { business, service }
}

const MONDAY: &str = "2025-11-17";
const DAY_MS: i64 = 86_400_000;

/// Midnight of 2025-11-17 in unix millis.
fn monday_start_ms() -> i64 {
    // 2025-11-17 is 20409 days after the epoch.
    20_409 * DAY_MS
}

fn slot_ms(start_minute: i64, duration_minutes: i64) -> (i64, i64) {
    let start = monday_start_ms() + start_minute * 60_000;
    (start, start + duration_minutes * 60_000)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn slots_reflect_bookings_end_to_end() {
    let (addr, _tm) = start_test_server().await;
    let owner = connect(addr, "owner", "flow").await;
    let guest = connect(addr, "guest", "flow").await;
    let salon = seed_salon(&owner).await;
    let (business, service) = (salon.business, salon.service);

    // A fresh Monday has 18 open half-hour slots
    let rows = query_rows(
        &owner,
        &format!(
            "SELECT * FROM slots WHERE business_id = '{business}' AND service_id = '{service}' AND date = '{MONDAY}'"
        ),
    )
    .await;
    assert_eq!(rows.len(), 18);
    assert_eq!(rows[0].get(2), Some("09:00"));
    assert_eq!(rows[17].get(2), Some("17:30"));
    assert!(rows.iter().all(|r| is_true(r.get(4))));

    // Book 09:00–09:30 as a guest
    let booking = Ulid::new();
    let (start, end) = slot_ms(540, 30);
    guest
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, business_id, service_id, customer_id, start, "end") VALUES ('{booking}', '{business}', '{service}', NULL, {start}, {end})"#
        ))
        .await
        .unwrap();

    // Only the 09:00 slot flips
    let rows = query_rows(
        &guest,
        &format!(
            "SELECT * FROM slots WHERE business_id = '{business}' AND service_id = '{service}' AND date = '{MONDAY}'"
        ),
    )
    .await;
    assert_eq!(rows.len(), 18);
    assert!(!is_true(rows[0].get(4)));
    assert!(rows[1..].iter().all(|r| is_true(r.get(4))));

    // The same window is refused now
    let other = Ulid::new();
    let err = guest
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, business_id, service_id, customer_id, start, "end") VALUES ('{other}', '{business}', '{service}', NULL, {start}, {end})"#
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("slot no longer available"));
}

#[tokio::test]
async fn booking_status_flow_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let owner = connect(addr, "owner", "status_flow").await;
    let guest = connect(addr, "guest", "status_flow").await;
    let salon = seed_salon(&owner).await;
    let (business, service) = (salon.business, salon.service);

    let booking = Ulid::new();
    let customer = Ulid::new();
    let (start, end) = slot_ms(600, 30);
    guest
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, business_id, service_id, customer_id, start, "end", notes) VALUES ('{booking}', '{business}', '{service}', '{customer}', {start}, {end}, 'first visit')"#
        ))
        .await
        .unwrap();

    let rows = query_rows(
        &owner,
        &format!("SELECT * FROM bookings WHERE business_id = '{business}' AND date = '{MONDAY}'"),
    )
    .await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(6), Some("pending"));

    // A guest session cannot complete a booking
    let err = guest
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'completed' WHERE id = '{booking}'"
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("forbidden"));

    // The wrong customer cannot cancel it
    let mallory = Ulid::new();
    let err = guest
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'cancelled' WHERE id = '{booking}' AND customer_id = '{mallory}'"
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("forbidden"));

    // Owner confirms, then completes
    owner
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'confirmed' WHERE id = '{booking}'"
        ))
        .await
        .unwrap();
    owner
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'completed' WHERE id = '{booking}'"
        ))
        .await
        .unwrap();

    // Completing again trips the terminal-state guard
    let err = owner
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'completed' WHERE id = '{booking}'"
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid status transition"));
}

#[tokio::test]
async fn payment_callback_is_idempotent_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let owner = connect(addr, "owner", "payment").await;
    let salon = seed_salon(&owner).await;
    let (business, service) = (salon.business, salon.service);

    let booking = Ulid::new();
    let (start, end) = slot_ms(660, 30);
    owner
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, business_id, service_id, customer_id, start, "end") VALUES ('{booking}', '{business}', '{service}', NULL, {start}, {end})"#
        ))
        .await
        .unwrap();

    let confirm = format!(
        "UPDATE bookings SET is_paid = true, payment_method = 'card', payment_ref = 'pay_7' WHERE id = '{booking}'"
    );
    owner.batch_execute(&confirm).await.unwrap();
    // Second delivery of the same callback is not an error
    owner.batch_execute(&confirm).await.unwrap();

    let rows = query_rows(
        &owner,
        &format!("SELECT * FROM bookings WHERE business_id = '{business}'"),
    )
    .await;
    assert!(is_true(rows[0].get(7)));
}

#[tokio::test]
async fn subscription_lifecycle_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let owner = connect(addr, "owner", "subs").await;
    let salon = seed_salon(&owner).await;
    let business = salon.business;

    // Registration opened a trial
    let rows = query_rows(
        &owner,
        &format!("SELECT * FROM subscriptions WHERE business_id = '{business}'"),
    )
    .await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(2), Some("trial"));

    // Payment confirmation activates
    owner
        .batch_execute(&format!(
            "UPDATE subscriptions SET status = 'active' WHERE business_id = '{business}'"
        ))
        .await
        .unwrap();
    let rows = query_rows(
        &owner,
        &format!("SELECT * FROM subscriptions WHERE business_id = '{business}'"),
    )
    .await;
    assert_eq!(rows[0].get(2), Some("active"));
    assert_eq!(rows[0].get(5), None); // trial marker cleared

    // Cancel schedules the flag but keeps the record active
    owner
        .batch_execute(&format!(
            "UPDATE subscriptions SET cancel_at_period_end = true WHERE business_id = '{business}'"
        ))
        .await
        .unwrap();
    let rows = query_rows(
        &owner,
        &format!("SELECT * FROM subscriptions WHERE business_id = '{business}'"),
    )
    .await;
    assert_eq!(rows[0].get(2), Some("active"));
    assert!(is_true(rows[0].get(6)));

    // Reactivate lifts it
    owner
        .batch_execute(&format!(
            "UPDATE subscriptions SET cancel_at_period_end = false WHERE business_id = '{business}'"
        ))
        .await
        .unwrap();
    let rows = query_rows(
        &owner,
        &format!("SELECT * FROM subscriptions WHERE business_id = '{business}'"),
    )
    .await;
    assert!(!is_true(rows[0].get(6)));
}

#[tokio::test]
async fn bulk_replace_swaps_the_whole_week() {
    let (addr, _tm) = start_test_server().await;
    let owner = connect(addr, "owner", "bulk_hours").await;
    let salon = seed_salon(&owner).await;
    let business = salon.business;

    owner
        .batch_execute(&format!(
            "INSERT INTO working_hours (business_id, weekday, start_minute, end_minute, active) VALUES \
             ('{business}', 2, 480, 720, true), \
             ('{business}', 3, 480, 720, true), \
             ('{business}', 4, 480, 720, false)"
        ))
        .await
        .unwrap();

    let rows = query_rows(
        &owner,
        &format!("SELECT * FROM working_hours WHERE business_id = '{business}'"),
    )
    .await;
    // The seeded Monday record is gone; only the new week remains
    assert_eq!(rows.len(), 3);
    let weekdays: Vec<Option<&str>> = rows.iter().map(|r| r.get(1)).collect();
    assert_eq!(weekdays, vec![Some("2"), Some("3"), Some("4")]);
}

#[tokio::test]
async fn tenants_are_isolated_end_to_end() {
    let (addr, _tm) = start_test_server().await;
    let owner_a = connect(addr, "owner", "tenant_a").await;
    let owner_b = connect(addr, "owner", "tenant_b").await;

    let salon = seed_salon(&owner_a).await;
    let (business, service) = (salon.business, salon.service);

    // Tenant B never registered this business
    let err = owner_b
        .simple_query(&format!(
            "SELECT * FROM slots WHERE business_id = '{business}' AND service_id = '{service}' AND date = '{MONDAY}'"
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
}
