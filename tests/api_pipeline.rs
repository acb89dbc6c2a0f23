//! End-to-end pipeline tests against a fake upstream provider.
//!
//! Each test boots a full gateway (store, bootstrap, router) on an
//! ephemeral port and talks to it over HTTP, so the whole chain
//! authenticate → resolve → authorize → dispatch → filter → audit is
//! exercised.

mod common;

use common::{record, FakeBackend, Harness};
use dns_gateway::store::{AuditFilter, Operation, RealmType};
use pretty_assertions::assert_eq;
use serde_json::json;

fn example_records() -> Vec<dns_gateway::backend::DnsRecord> {
    vec![
        record("1", "home", "A", "192.0.2.1"),
        record("2", "www", "A", "192.0.2.2"),
        record("3", "home", "TXT", "v=spf1 -all"),
        record("4", "@", "MX", "mail.example.com"),
    ]
}

#[tokio::test]
async fn successful_read_is_filtered_to_realm_and_type() {
    // GIVEN: a host realm on home.example.com, types {A}, ops {read},
    // caller IP in the origin list
    let harness = Harness::start_default().await;
    let token = harness
        .seed_platform_token(
            "example.com",
            "home",
            RealmType::Host,
            vec![Operation::Read],
            vec!["A".into()],
            vec!["127.0.0.1/32".into()],
            FakeBackend::with_records(example_records()),
        )
        .await;

    // WHEN: reading the zone
    let (status, body) = harness
        .api(&token, "infoDnsRecords", json!({"domainname": "example.com"}))
        .await;

    // THEN: 200 with only the home/A record
    assert_eq!(status, 200);
    assert_eq!(body["status"], "success");
    let records = body["responsedata"]["dnsrecords"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["hostname"], "home");
    assert_eq!(records[0]["type"], "A");

    // AND: exactly one audit record, outcome success
    let audit = harness
        .app
        .store
        .audit_query(&AuditFilter {
            outcome: Some("success".into()),
            domain: Some("example.com".into()),
            ..AuditFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].operation, "infoDnsRecords");
}

#[tokio::test]
async fn request_outside_realm_is_denied_with_zone_reason() {
    // GIVEN: the same read-only host realm
    let harness = Harness::start_default().await;
    let token = harness
        .seed_platform_token(
            "example.com",
            "home",
            RealmType::Host,
            vec![Operation::Read],
            vec!["A".into()],
            vec![],
            FakeBackend::with_records(example_records()),
        )
        .await;

    // WHEN: addressing a sibling zone
    let (status, body) = harness
        .api(&token, "infoDnsRecords", json!({"domainname": "other.example.com"}))
        .await;

    // THEN: 403 zone_not_in_realm, audit outcome denied
    assert_eq!(status, 403);
    assert_eq!(body["reason"], "zone_not_in_realm");

    let audit = harness
        .app
        .store
        .audit_query(&AuditFilter {
            outcome: Some("denied".into()),
            ..AuditFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].error_kind.as_deref(), Some("zone_not_in_realm"));
}

#[tokio::test]
async fn write_with_read_only_token_is_denied() {
    // GIVEN: a read-only token
    let harness = Harness::start_default().await;
    let token = harness
        .seed_platform_token(
            "example.com",
            "home",
            RealmType::Host,
            vec![Operation::Read],
            vec!["A".into()],
            vec![],
            FakeBackend::with_records(example_records()),
        )
        .await;

    // WHEN: attempting an update on its own realm
    let (status, body) = harness
        .api(
            &token,
            "updateDnsRecords",
            json!({
                "domainname": "home.example.com",
                "dnsrecordset": {"dnsrecords": [
                    {"hostname": "@", "type": "A", "destination": "203.0.113.9"}
                ]}
            }),
        )
        .await;

    // THEN: 403 operation_not_allowed
    assert_eq!(status, 403);
    assert_eq!(body["reason"], "operation_not_allowed");
}

#[tokio::test]
async fn subdomain_realm_updates_inside_and_rejects_outside() {
    // GIVEN: a subdomain realm on dyn.example.com with {A, AAAA} and
    // {read, update}
    let harness = Harness::start_default().await;
    let backend = FakeBackend::with_records(vec![record("1", "myhost.dyn", "A", "192.0.2.50")]);
    let token = harness
        .seed_platform_token(
            "example.com",
            "dyn",
            RealmType::Subdomain,
            vec![Operation::Read, Operation::Update],
            vec!["A".into(), "AAAA".into()],
            vec![],
            backend.clone(),
        )
        .await;

    // WHEN: updating a host inside the realm
    let (status, body) = harness
        .api(
            &token,
            "updateDnsRecords",
            json!({
                "domainname": "dyn.example.com",
                "dnsrecordset": {"dnsrecords": [
                    {"hostname": "myhost", "type": "A", "destination": "203.0.113.5"}
                ]}
            }),
        )
        .await;

    // THEN: it succeeds and the upstream zone reflects it
    assert_eq!(status, 200);
    assert_eq!(body["status"], "success");
    let stored = backend.records.lock().clone();
    assert_eq!(stored[0].value, "203.0.113.5");

    // AND: a host outside the realm rejects the whole request
    let (status, body) = harness
        .api(
            &token,
            "updateDnsRecords",
            json!({
                "domainname": "example.com",
                "dnsrecordset": {"dnsrecords": [
                    {"hostname": "foo", "type": "A", "destination": "203.0.113.6"}
                ]}
            }),
        )
        .await;
    assert_eq!(status, 403);
    assert_eq!(body["reason"], "zone_not_in_realm");
}

#[tokio::test]
async fn rate_limit_returns_429_with_retry_after() {
    // GIVEN: a 3/minute budget
    let harness = Harness::start(|config| config.rate_limit_per_min = 3).await;
    let token = harness
        .seed_platform_token(
            "example.com",
            "home",
            RealmType::Host,
            vec![Operation::Read],
            vec![],
            vec![],
            FakeBackend::with_records(example_records()),
        )
        .await;

    // WHEN: spending the budget
    for _ in 0..3 {
        let (status, _) = harness
            .api(&token, "infoDnsZone", json!({"domainname": "home.example.com"}))
            .await;
        assert_eq!(status, 200);
    }

    // THEN: the next request is refused with Retry-After
    let response = harness
        .client
        .post(format!("http://{}/api", harness.addr))
        .bearer_auth(&token)
        .json(&json!({"action": "infoDnsZone", "param": {"domainname": "home.example.com"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);
    assert!(response.headers().contains_key("retry-after"));

    // AND: only the refused request audited as rate_limited
    let audit = harness
        .app
        .store
        .audit_query(&AuditFilter {
            outcome: Some("error".into()),
            ..AuditFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].error_kind.as_deref(), Some("rate_limited"));
}

#[tokio::test]
async fn unavailable_backend_maps_to_503_and_healthy_one_still_serves() {
    // GIVEN: two roots on two providers, one down and one healthy
    let harness = Harness::start_default().await;
    let token_down = harness
        .seed_platform_token(
            "one.example",
            "host",
            RealmType::Host,
            vec![Operation::Read],
            vec![],
            vec![],
            FakeBackend::unavailable(),
        )
        .await;
    let token_up = harness
        .seed_platform_token(
            "two.example",
            "host",
            RealmType::Host,
            vec![Operation::Read],
            vec![],
            vec![],
            FakeBackend::with_records(vec![record("1", "host", "A", "192.0.2.9")]),
        )
        .await;

    // WHEN/THEN: the broken root returns 503, the healthy one 200
    let (status, body) = harness
        .api(&token_down, "infoDnsZone", json!({"domainname": "host.one.example"}))
        .await;
    assert_eq!(status, 503);
    assert_eq!(body["reason"], "backend_unavailable");

    let (status, _) = harness
        .api(&token_up, "infoDnsZone", json!({"domainname": "host.two.example"}))
        .await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn record_cap_boundary() {
    // GIVEN: a cap of 5 records per request
    let harness = Harness::start_default().await;
    let token = harness
        .seed_platform_token(
            "example.com",
            "dyn",
            RealmType::Subdomain,
            vec![],
            vec![],
            vec![],
            FakeBackend::with_records(vec![]),
        )
        .await;

    let records = |n: usize| -> Vec<serde_json::Value> {
        (0..n)
            .map(|i| json!({"hostname": format!("h{i}"), "type": "A", "destination": "192.0.2.1"}))
            .collect()
    };

    // WHEN/THEN: exactly the cap succeeds
    let (status, _) = harness
        .api(
            &token,
            "updateDnsRecords",
            json!({"domainname": "dyn.example.com", "dnsrecordset": {"dnsrecords": records(5)}}),
        )
        .await;
    assert_eq!(status, 200);

    // AND: one more is malformed_request
    let (status, body) = harness
        .api(
            &token,
            "updateDnsRecords",
            json!({"domainname": "dyn.example.com", "dnsrecordset": {"dnsrecords": records(6)}}),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["reason"], "malformed_request");

    // AND: the cap runs before authentication, so an over-cap request
    // with a bogus token is 400, not 401
    let (status, body) = harness
        .api(
            "not-a-token",
            "updateDnsRecords",
            json!({"domainname": "dyn.example.com", "dnsrecordset": {"dnsrecords": records(6)}}),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["reason"], "malformed_request");
}

#[tokio::test]
async fn oversized_body_is_413() {
    // GIVEN: a 4 KiB body limit
    let harness = Harness::start_default().await;

    // WHEN: posting a body past the limit
    let padding = "x".repeat(5000);
    let response = harness
        .client
        .post(format!("http://{}/api", harness.addr))
        .header("content-type", "application/json")
        .body(format!("{{\"action\": \"infoDnsZone\", \"pad\": \"{padding}\"}}"))
        .send()
        .await
        .unwrap();

    // THEN: refused before the pipeline
    assert_eq!(response.status(), 413);
}

#[tokio::test]
async fn invalid_token_is_opaque_401() {
    let harness = Harness::start_default().await;
    let _ = harness
        .seed_platform_token(
            "example.com",
            "home",
            RealmType::Host,
            vec![Operation::Read],
            vec![],
            vec![],
            FakeBackend::with_records(vec![]),
        )
        .await;

    // an unknown prefix and a wrong secret are indistinguishable
    for bad in [
        "AAAAbbbbCCCC:0123456789abcdefghijklmnopqrstuv",
        "not-a-token",
    ] {
        let (status, body) = harness
            .api(bad, "infoDnsZone", json!({"domainname": "home.example.com"}))
            .await;
        assert_eq!(status, 401);
        assert_eq!(body["reason"], "invalid_token");
    }
}

#[tokio::test]
async fn origin_restriction_denies_unlisted_caller() {
    // GIVEN: a token allowing only a foreign subnet
    let harness = Harness::start_default().await;
    let token = harness
        .seed_platform_token(
            "example.com",
            "home",
            RealmType::Host,
            vec![Operation::Read],
            vec![],
            vec!["198.51.100.0/24".into()],
            FakeBackend::with_records(vec![]),
        )
        .await;

    // WHEN: calling from 127.0.0.1
    let (status, body) = harness
        .api(&token, "infoDnsZone", json!({"domainname": "home.example.com"}))
        .await;

    // THEN: 403 origin_not_allowed
    assert_eq!(status, 403);
    assert_eq!(body["reason"], "origin_not_allowed");
}

#[tokio::test]
async fn upsert_and_delete_round_trip() {
    // GIVEN: a writable subdomain realm
    let harness = Harness::start_default().await;
    let backend = FakeBackend::with_records(vec![]);
    let token = harness
        .seed_platform_token(
            "example.com",
            "dyn",
            RealmType::Subdomain,
            vec![],
            vec![],
            vec![],
            backend.clone(),
        )
        .await;

    // WHEN: creating a record through the vendor envelope
    let (status, body) = harness
        .api(
            &token,
            "updateDnsRecords",
            json!({
                "domainname": "dyn.example.com",
                "dnsrecordset": {"dnsrecords": [
                    {"hostname": "box", "type": "A", "destination": "192.0.2.77"}
                ]}
            }),
        )
        .await;
    assert_eq!(status, 200);
    let created = &body["responsedata"]["dnsrecords"][0];
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["destination"], "192.0.2.77");

    // AND: upserting the same (hostname, type) without an id updates it
    let (status, _) = harness
        .api(
            &token,
            "updateDnsRecords",
            json!({
                "domainname": "dyn.example.com",
                "dnsrecordset": {"dnsrecords": [
                    {"hostname": "box", "type": "A", "destination": "192.0.2.78"}
                ]}
            }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(backend.records.lock().len(), 1);
    assert_eq!(backend.records.lock()[0].value, "192.0.2.78");

    // AND: deleterecord removes it
    let (status, _) = harness
        .api(
            &token,
            "updateDnsRecords",
            json!({
                "domainname": "dyn.example.com",
                "dnsrecordset": {"dnsrecords": [
                    {"id": id, "hostname": "box", "type": "A", "deleterecord": true}
                ]}
            }),
        )
        .await;
    assert_eq!(status, 200);
    assert!(backend.records.lock().is_empty());
}

#[tokio::test]
async fn audit_never_contains_token_plaintext() {
    // GIVEN: a completed successful request
    let harness = Harness::start_default().await;
    let token = harness
        .seed_platform_token(
            "example.com",
            "home",
            RealmType::Host,
            vec![Operation::Read],
            vec![],
            vec![],
            FakeBackend::with_records(example_records()),
        )
        .await;
    let (status, _) = harness
        .api(&token, "infoDnsRecords", json!({"domainname": "example.com"}))
        .await;
    assert_eq!(status, 200);

    // THEN: no audit row carries the plaintext; the prefix is present
    let secret_part = token.split_once(':').unwrap().1;
    let rows = harness
        .app
        .store
        .audit_query(&AuditFilter::default())
        .await
        .unwrap();
    assert!(!rows.is_empty());
    for row in &rows {
        let serialized = serde_json::to_string(row).unwrap();
        assert!(!serialized.contains(secret_part), "audit leaked the secret");
    }
    assert!(rows.iter().any(|r| r.token_prefix.is_some()));
}
