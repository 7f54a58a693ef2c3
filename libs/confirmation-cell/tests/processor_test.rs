mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, ResponseTemplate};

use appointment_cell::*;
use common::{date, time, Fixture, SECRET};
use confirmation_cell::*;
use event_bus_cell::{publish_json, ConfirmationEvent, ConfirmedEvent, DeadLetterEvent, EventBus, QueueName};

#[tokio::test]
async fn test_three_failures_dead_letter_the_confirmation() {
    let fx = Fixture::new().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "boom"})))
        .expect(3)
        .mount(&fx.server)
        .await;

    let appointment = fx.book().await;
    let processor = fx.processor();

    assert_eq!(fx.process_next(&processor).await, Disposition::RetryScheduled { attempt: 1 });
    assert_eq!(fx.process_next(&processor).await, Disposition::RetryScheduled { attempt: 2 });
    assert_eq!(fx.process_next(&processor).await, Disposition::DeadLettered { attempts: 3 });

    let stored = fx.appointment(appointment.id).await;
    assert_eq!(stored.status, AppointmentStatus::Pending);
    assert!(!stored.confirmation_sent);
    assert_eq!(stored.confirmation_attempts, 3);
    assert!(stored.last_attempt_at.is_some());
    let last: Value = serde_json::from_str(stored.last_confirmation_response.as_deref().unwrap()).unwrap();
    assert_eq!(last["status"], 500);
    assert_eq!(last["data"]["error"], "boom");

    let dead = fx.bus.messages(QueueName::DeadLetter);
    assert_eq!(dead.len(), 1);
    let event: DeadLetterEvent = serde_json::from_str(&dead[0].payload).unwrap();
    assert_eq!(event.appointment_id, appointment.id);
    assert_eq!(event.attempts, 3);
    assert!(event.last_response.is_some());

    assert!(fx.try_next_delivery(Duration::from_millis(100)).await.is_none());
    assert!(fx.bus.messages(QueueName::Confirmed).is_empty());
}

#[tokio::test]
async fn test_successful_call_confirms_appointment() {
    let fx = Fixture::new().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"received": true})))
        .expect(1)
        .mount(&fx.server)
        .await;

    let appointment = fx.book().await;
    let processor = fx.processor();

    assert_eq!(fx.process_next(&processor).await, Disposition::Confirmed { attempts: 1 });

    let stored = fx.appointment(appointment.id).await;
    assert_eq!(stored.status, AppointmentStatus::Confirmed);
    assert!(stored.confirmation_sent);
    assert_eq!(stored.confirmation_attempts, 1);
    let last: Value = serde_json::from_str(stored.last_confirmation_response.as_deref().unwrap()).unwrap();
    assert_eq!(last["status"], 200);
    assert_eq!(last["data"]["received"], true);

    let confirmed = fx.bus.messages(QueueName::Confirmed);
    assert_eq!(confirmed.len(), 1);
    let event: ConfirmedEvent = serde_json::from_str(&confirmed[0].payload).unwrap();
    assert_eq!(event.appointment_id, appointment.id);
    assert_eq!(event.attempts, 1);
}

#[tokio::test]
async fn test_success_after_a_failure_counts_both_attempts() {
    let fx = Fixture::new().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&fx.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&fx.server)
        .await;

    let appointment = fx.book().await;
    let processor = fx.processor();

    assert_eq!(fx.process_next(&processor).await, Disposition::RetryScheduled { attempt: 1 });
    assert_eq!(fx.process_next(&processor).await, Disposition::Confirmed { attempts: 2 });

    let stored = fx.appointment(appointment.id).await;
    assert_eq!(stored.status, AppointmentStatus::Confirmed);
    assert_eq!(stored.confirmation_attempts, 2);
}

#[tokio::test]
async fn test_redelivery_after_success_is_skipped_without_calling_endpoint() {
    let fx = Fixture::new().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&fx.server)
        .await;

    let appointment = fx.book().await;
    let processor = fx.processor();
    assert_eq!(fx.process_next(&processor).await, Disposition::Confirmed { attempts: 1 });

    let duplicate =
        ConfirmationEvent::first_attempt(appointment.id, appointment.professional_id, appointment.patient_id);
    publish_json(fx.bus.as_ref(), QueueName::Created.routing_key(), &duplicate)
        .await
        .unwrap();

    assert_eq!(
        fx.process_next(&processor).await,
        Disposition::Skipped(SkipReason::AlreadySent)
    );
    assert_eq!(fx.appointment(appointment.id).await.confirmation_attempts, 1);
    assert_eq!(fx.bus.messages(QueueName::Confirmed).len(), 1);
}

#[tokio::test]
async fn test_stale_attempt_number_is_skipped() {
    let fx = Fixture::new().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&fx.server)
        .await;

    let appointment = fx.book().await;
    let processor = fx.processor();

    // Keep a copy of the original delivery to replay after the first attempt
    let original = fx.next_delivery().await;
    assert_eq!(
        processor.handle(&original).await.unwrap(),
        Disposition::RetryScheduled { attempt: 1 }
    );

    assert_eq!(
        processor.handle(&original).await.unwrap(),
        Disposition::Skipped(SkipReason::StaleAttempt { event: 0, stored: 1 })
    );
    assert_eq!(fx.appointment(appointment.id).await.confirmation_attempts, 1);
    fx.bus.ack(&original).await.unwrap();
}

#[tokio::test]
async fn test_cancelled_appointment_is_not_notified() {
    let fx = Fixture::new().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&fx.server)
        .await;

    let appointment = fx.book().await;
    AppointmentLifecycleService::new(fx.store.clone(), fx.dyn_bus())
        .cancel(appointment.id)
        .await
        .unwrap();

    assert_eq!(
        fx.process_next(&fx.processor()).await,
        Disposition::Skipped(SkipReason::Cancelled)
    );
    let stored = fx.appointment(appointment.id).await;
    assert_eq!(stored.status, AppointmentStatus::Cancelled);
    assert_eq!(stored.confirmation_attempts, 0);
}

#[tokio::test]
async fn test_unknown_appointment_is_rejected() {
    let fx = Fixture::new().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&fx.server)
        .await;

    let event = ConfirmationEvent::first_attempt(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    publish_json(fx.bus.as_ref(), QueueName::Created.routing_key(), &event)
        .await
        .unwrap();

    let delivery = fx.next_delivery().await;
    let disposition = fx.processor().handle(&delivery).await.unwrap();
    assert_matches!(disposition, Disposition::Rejected(_));
    assert!(!disposition.should_ack());
}

#[tokio::test]
async fn test_malformed_event_is_rejected() {
    let fx = Fixture::new().await;
    fx.bus
        .publish(QueueName::Created.routing_key(), "{not json")
        .await
        .unwrap();

    let delivery = fx.next_delivery().await;
    assert_matches!(fx.processor().handle(&delivery).await, Ok(Disposition::Rejected(_)));
}

#[tokio::test]
async fn test_retry_publish_failure_leaves_attempt_unrecorded() {
    let fx = Fixture::new().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&fx.server)
        .await;

    let appointment = fx.book().await;
    let delivery = fx.next_delivery().await;

    fx.bus.set_fail_publishes(true);
    let result = fx.processor().handle(&delivery).await;
    assert_matches!(result, Err(ConfirmationError::Bus(_)));

    let stored = fx.appointment(appointment.id).await;
    assert_eq!(stored.confirmation_attempts, 0);
    assert!(stored.last_attempt_at.is_none());
    assert!(fx.bus.messages(QueueName::Retry).is_empty());
}

#[tokio::test]
async fn test_confirmed_publish_failure_still_confirms() {
    let fx = Fixture::new().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&fx.server)
        .await;

    let appointment = fx.book().await;
    let delivery = fx.next_delivery().await;

    fx.bus.set_fail_publishes(true);
    let disposition = fx.processor().handle(&delivery).await.unwrap();
    assert_eq!(disposition, Disposition::Confirmed { attempts: 1 });

    let stored = fx.appointment(appointment.id).await;
    assert_eq!(stored.status, AppointmentStatus::Confirmed);
    assert!(stored.confirmation_sent);
}

#[tokio::test]
async fn test_signature_covers_exact_body_bytes() {
    let fx = Fixture::new().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .and(header_exists(SIGNATURE_HEADER))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&fx.server)
        .await;

    let appointment = fx.book().await;
    fx.process_next(&fx.processor()).await;

    let requests = fx.server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    let signature = request.headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
    assert_eq!(signature, sign(SECRET, &request.body).unwrap());
    assert!(verify_signature(SECRET, &request.body, signature));
    assert_eq!(
        request.headers.get(EVENT_HEADER).unwrap().to_str().unwrap(),
        APPOINTMENT_CREATED_EVENT
    );
    assert_eq!(
        request.headers.get("content-type").unwrap().to_str().unwrap(),
        "application/json"
    );

    let body: Value = serde_json::from_slice(&request.body).unwrap();
    let reformatted = serde_json::to_vec_pretty(&body).unwrap();
    assert!(!verify_signature(SECRET, &reformatted, signature));
    assert!(!verify_signature("wrong-secret", &request.body, signature));

    assert_eq!(body["event"], "appointment.created");
    assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
    let data = &body["data"];
    assert_eq!(data["appointmentId"], appointment.id.to_string());
    assert_eq!(data["professional"]["name"], "Dr. Laura Diaz");
    assert_eq!(data["professional"]["specialty"], "Cardiology");
    assert_eq!(data["patient"]["name"], "Ana Perez");
    assert_eq!(data["patient"]["email"], "ana@example.com");
    assert_eq!(data["appointmentDate"], "2025-03-10");
    assert_eq!(data["startTime"], "10:00");
    assert_eq!(data["endTime"], "10:30");
    assert_eq!(data["status"], "PENDING");
    assert_eq!(data["reason"], "Routine check-up");
}

#[tokio::test]
async fn test_missing_profile_sends_null_names() {
    let fx = Fixture::new().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&fx.server)
        .await;

    let unknown_patient = Uuid::new_v4();
    let appointment = Appointment::pending(&ReserveRequest {
        patient_id: unknown_patient,
        professional_id: fx.professional_id,
        date: common::date(),
        start_time: common::time(11, 0),
        end_time: common::time(11, 30),
        reason: None,
    });
    fx.store.insert_appointment(appointment.clone());
    let event = ConfirmationEvent::first_attempt(appointment.id, fx.professional_id, unknown_patient);
    publish_json(fx.bus.as_ref(), QueueName::Created.routing_key(), &event)
        .await
        .unwrap();

    assert_eq!(fx.process_next(&fx.processor()).await, Disposition::Confirmed { attempts: 1 });

    let requests = fx.server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["data"]["patient"]["id"], unknown_patient.to_string());
    assert!(body["data"]["patient"]["name"].is_null());
    assert!(body["data"]["patient"]["email"].is_null());
    assert_eq!(body["data"]["professional"]["name"], "Dr. Laura Diaz");
    assert!(body["data"]["reason"].is_null());
}

#[tokio::test]
async fn test_timeout_counts_as_failed_attempt() {
    let fx = Fixture::new().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&fx.server)
        .await;

    let appointment = fx.book().await;
    let processor = fx.processor_with_timeout(Duration::from_millis(50));

    assert_eq!(fx.process_next(&processor).await, Disposition::RetryScheduled { attempt: 1 });

    let stored = fx.appointment(appointment.id).await;
    assert!(!stored.confirmation_sent);
    let last: Value = serde_json::from_str(stored.last_confirmation_response.as_deref().unwrap()).unwrap();
    assert_eq!(last["code"], "TIMEOUT");
}

/// Cancels the appointment and books the same time again while the
/// notification is in flight.
struct CancelAndRebookNotifier {
    appointment_id: Uuid,
    lifecycle: AppointmentLifecycleService,
    booking: AppointmentBookingService,
    request: ReserveRequest,
}

#[async_trait]
impl Notifier for CancelAndRebookNotifier {
    async fn notify(&self, _payload: &SignedPayload) -> NotificationOutcome {
        self.lifecycle.cancel(self.appointment_id).await.unwrap();
        self.booking.reserve(self.request.clone()).await.unwrap();
        NotificationOutcome {
            delivered: true,
            http_status: Some(200),
            response: "{}".to_string(),
        }
    }
}

#[tokio::test]
async fn test_cancel_during_notification_is_not_overwritten() {
    let fx = Fixture::new().await;
    let appointment = fx.book().await;

    let request = ReserveRequest {
        patient_id: fx.patient_id,
        professional_id: fx.professional_id,
        date: date(),
        start_time: time(10, 0),
        end_time: time(10, 30),
        reason: None,
    };
    let notifier = CancelAndRebookNotifier {
        appointment_id: appointment.id,
        lifecycle: AppointmentLifecycleService::new(fx.store.clone(), fx.dyn_bus()),
        booking: AppointmentBookingService::new(fx.store.clone(), fx.profiles.clone(), fx.dyn_bus(), &fx.config),
        request,
    };
    let processor = ConfirmationProcessor::new(
        fx.store.clone(),
        fx.profiles.clone(),
        fx.dyn_bus(),
        Arc::new(notifier),
        &fx.config,
    );

    assert_eq!(
        fx.process_next(&processor).await,
        Disposition::DeliveredAfterCancel { attempts: 1 }
    );

    let stored = fx.appointment(appointment.id).await;
    assert_eq!(stored.status, AppointmentStatus::Cancelled);
    assert!(stored.confirmation_sent);
    assert_eq!(stored.confirmation_attempts, 1);
    assert!(fx.bus.messages(QueueName::Confirmed).is_empty());

    let active = fx
        .store
        .list_appointments(&AppointmentFilter {
            professional_id: Some(fx.professional_id),
            from_date: Some(date()),
            to_date: Some(date()),
            ..AppointmentFilter::default()
        })
        .await
        .unwrap()
        .into_iter()
        .filter(|a| a.status.holds_slot() && a.start_time == time(10, 0))
        .count();
    assert_eq!(active, 1);
}
