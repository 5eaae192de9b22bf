//! Gateway webhook integration tests for billing-service.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use billing_service::models::InvoiceStatus;
use billing_service::services::{BillingStore, WebhookError, WebhookOutcome};
use billing_service::startup::router;
use chrono::{Duration, TimeZone, Utc};
use common::{invoice_event, now, sign, TestContext};
use tower::ServiceExt;

#[tokio::test]
async fn payment_succeeded_marks_sent_invoice_paid() {
    let ctx = TestContext::new();
    let client = ctx.client("Acme").await;
    let invoice = ctx.sent_invoice(&client, "INV-202403-0001", "in_paid").await;

    let processed_at = Utc.with_ymd_and_hms(2024, 3, 20, 9, 30, 0).unwrap();
    let payload = invoice_event("invoice.payment_succeeded", "in_paid");
    let outcome = ctx
        .state
        .reconciler
        .handle_at(&payload, Some(&sign(&payload, processed_at)), processed_at)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        WebhookOutcome::Applied {
            invoice_number: "INV-202403-0001".to_string(),
            status: InvoiceStatus::Paid,
        }
    );

    let stored = ctx.store.get_invoice(invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Paid);
    assert_eq!(stored.paid_utc, Some(processed_at));
    assert_eq!(stored.sent_utc, invoice.sent_utc);
}

#[tokio::test]
async fn repeated_payment_is_a_no_op() {
    let ctx = TestContext::new();
    let client = ctx.client("Acme").await;
    let invoice = ctx.sent_invoice(&client, "INV-202403-0001", "in_paid").await;
    let payload = invoice_event("invoice.payment_succeeded", "in_paid");

    let first_at = now();
    ctx.state
        .reconciler
        .handle_at(&payload, Some(&sign(&payload, first_at)), first_at)
        .await
        .unwrap();

    let replay_at = first_at + Duration::hours(2);
    let outcome = ctx
        .state
        .reconciler
        .handle_at(&payload, Some(&sign(&payload, replay_at)), replay_at)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        WebhookOutcome::Ignored {
            invoice_number: "INV-202403-0001".to_string(),
            status: InvoiceStatus::Paid,
        }
    );
    let stored = ctx.store.get_invoice(invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(stored.paid_utc, Some(first_at));
}

#[tokio::test]
async fn failed_payment_marks_overdue_until_paid() {
    let ctx = TestContext::new();
    let client = ctx.client("Acme").await;
    let invoice = ctx.sent_invoice(&client, "INV-202403-0001", "in_late").await;
    let reconciler = &ctx.state.reconciler;

    let failed = invoice_event("invoice.payment_failed", "in_late");
    let outcome = reconciler
        .handle_at(&failed, Some(&sign(&failed, now())), now())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        WebhookOutcome::Applied {
            status: InvoiceStatus::Overdue,
            ..
        }
    ));

    // A second failure does not apply to an overdue invoice.
    let outcome = reconciler
        .handle_at(&failed, Some(&sign(&failed, now())), now())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        WebhookOutcome::Ignored {
            status: InvoiceStatus::Overdue,
            ..
        }
    ));

    let paid_at = now() + Duration::days(3);
    let succeeded = invoice_event("invoice.payment_succeeded", "in_late");
    reconciler
        .handle_at(&succeeded, Some(&sign(&succeeded, paid_at)), paid_at)
        .await
        .unwrap();

    let stored = ctx.store.get_invoice(invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Paid);
    assert_eq!(stored.paid_utc, Some(paid_at));

    // Paid is final.
    let outcome = reconciler
        .handle_at(&failed, Some(&sign(&failed, paid_at)), paid_at)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        WebhookOutcome::Ignored {
            status: InvoiceStatus::Paid,
            ..
        }
    ));
}

#[tokio::test]
async fn payment_events_do_not_touch_drafts_or_void_invoices() {
    let ctx = TestContext::new();
    let client = ctx.client("Acme").await;
    let draft = ctx.draft_invoice(&client, "INV-202403-0001", "100").await;
    let voided = ctx.sent_invoice(&client, "INV-202403-0002", "in_void").await;
    ctx.store.force_status(voided.invoice_id, InvoiceStatus::Void).await;

    // Drafts have no gateway id yet, so nothing can match them.
    assert!(draft.gateway_invoice_id.is_none());

    let payload = invoice_event("invoice.payment_succeeded", "in_void");
    let outcome = ctx
        .state
        .reconciler
        .handle_at(&payload, Some(&sign(&payload, now())), now())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        WebhookOutcome::Ignored {
            status: InvoiceStatus::Void,
            ..
        }
    ));

    let stored = ctx.store.get_invoice(voided.invoice_id).await.unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Void);
    assert_eq!(stored.paid_utc, None);
}

#[tokio::test]
async fn gateway_sent_event_never_rolls_status_back() {
    let ctx = TestContext::new();
    let client = ctx.client("Acme").await;
    let invoice = ctx.sent_invoice(&client, "INV-202403-0001", "in_sent").await;

    let payload = invoice_event("invoice.sent", "in_sent");
    let outcome = ctx
        .state
        .reconciler
        .handle_at(&payload, Some(&sign(&payload, now())), now())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        WebhookOutcome::Ignored {
            status: InvoiceStatus::Sent,
            ..
        }
    ));

    // Once paid, a late invoice.sent must not roll the status back.
    ctx.store.force_status(invoice.invoice_id, InvoiceStatus::Paid).await;
    let outcome = ctx
        .state
        .reconciler
        .handle_at(&payload, Some(&sign(&payload, now())), now())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        WebhookOutcome::Ignored {
            status: InvoiceStatus::Paid,
            ..
        }
    ));
}

#[tokio::test]
async fn finalized_and_unhandled_events_change_nothing() {
    let ctx = TestContext::new();
    let client = ctx.client("Acme").await;
    let invoice = ctx.sent_invoice(&client, "INV-202403-0001", "in_1").await;
    let reconciler = &ctx.state.reconciler;

    let finalized = invoice_event("invoice.finalized", "in_1");
    assert_eq!(
        reconciler
            .handle_at(&finalized, Some(&sign(&finalized, now())), now())
            .await
            .unwrap(),
        WebhookOutcome::Informational
    );

    let unhandled = invoice_event("customer.subscription.updated", "sub_1");
    assert_eq!(
        reconciler
            .handle_at(&unhandled, Some(&sign(&unhandled, now())), now())
            .await
            .unwrap(),
        WebhookOutcome::Unhandled
    );

    let stored = ctx.store.get_invoice(invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Sent);
}

#[tokio::test]
async fn unknown_gateway_invoice_is_acknowledged() {
    let ctx = TestContext::new();

    for event_type in [
        "invoice.payment_succeeded",
        "invoice.payment_failed",
        "invoice.sent",
    ] {
        let payload = invoice_event(event_type, "in_not_ours");
        let outcome = ctx
            .state
            .reconciler
            .handle_at(&payload, Some(&sign(&payload, now())), now())
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::UnknownInvoice, "{}", event_type);
    }
}

#[tokio::test]
async fn bad_signatures_are_rejected() {
    let ctx = TestContext::new();
    let client = ctx.client("Acme").await;
    let invoice = ctx.sent_invoice(&client, "INV-202403-0001", "in_1").await;
    let reconciler = &ctx.state.reconciler;
    let payload = invoice_event("invoice.payment_succeeded", "in_1");

    let forged = service_core::utils::signature::webhook_signature_header(
        "whsec_someone_else",
        now().timestamp(),
        &payload,
    )
    .unwrap();
    let stale = sign(&payload, now() - Duration::minutes(10));
    let tampered = sign(&payload.replace("in_1", "in_2"), now());

    let candidates = [
        Some(forged.as_str()),
        Some(stale.as_str()),
        Some(tampered.as_str()),
        Some("garbage"),
        None,
    ];
    for signature in candidates {
        let err = reconciler
            .handle_at(&payload, signature, now())
            .await
            .unwrap_err();
        assert!(
            matches!(err, WebhookError::InvalidSignature(_)),
            "{:?} gave {:?}",
            signature,
            err
        );
    }

    let stored = ctx.store.get_invoice(invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Sent);
}

#[tokio::test]
async fn webhook_endpoint_acknowledges_verified_events() {
    let ctx = TestContext::new();
    let client = ctx.client("Acme").await;
    let invoice = ctx.sent_invoice(&client, "INV-202403-0001", "in_http").await;

    let payload = invoice_event("invoice.payment_succeeded", "in_http");
    let response = router(ctx.state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/gateway")
                .header("content-type", "application/json")
                .header("Stripe-Signature", sign(&payload, Utc::now()))
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, serde_json::json!({ "received": true }));

    let stored = ctx.store.get_invoice(invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn webhook_endpoint_accepts_generic_signature_header() {
    let ctx = TestContext::new();
    let payload = invoice_event("invoice.payment_succeeded", "in_unknown");

    let response = router(ctx.state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/gateway")
                .header("Signature", sign(&payload, Utc::now()))
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["received"], true);
}

#[tokio::test]
async fn webhook_endpoint_rejects_invalid_signature() {
    let ctx = TestContext::new();
    let payload = invoice_event("invoice.payment_succeeded", "in_1");

    let response = router(ctx.state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/gateway")
                .header("Stripe-Signature", "t=1,v1=deadbeef")
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await,
        serde_json::json!({ "error": "Invalid signature" })
    );
}

#[tokio::test]
async fn webhook_endpoint_rejects_malformed_payload() {
    let ctx = TestContext::new();
    let payload = r#"{"type":"invoice.payment_succeeded","data":{}}"#.to_string();

    let response = router(ctx.state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/gateway")
                .header("Stripe-Signature", sign(&payload, Utc::now()))
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await,
        serde_json::json!({ "error": "Invalid payload" })
    );
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
