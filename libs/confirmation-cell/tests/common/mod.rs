#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use uuid::Uuid;
use wiremock::MockServer;

use appointment_cell::*;
use confirmation_cell::*;
use event_bus_cell::{Delivery, EventBus, InMemoryEventBus, QueueName, Topology};
use shared_config::AppConfig;

pub const SECRET: &str = "S";
pub const RETRY_TTL: Duration = Duration::from_millis(30);

pub struct Fixture {
    pub server: MockServer,
    pub store: Arc<InMemoryReservationStore>,
    pub profiles: Arc<InMemoryProfileDirectory>,
    pub bus: Arc<InMemoryEventBus>,
    pub config: AppConfig,
    pub patient_id: Uuid,
    pub professional_id: Uuid,
}

pub fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
}

pub fn time(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

impl Fixture {
    pub async fn new() -> Self {
        let server = MockServer::start().await;

        let patient_id = Uuid::new_v4();
        let professional_id = Uuid::new_v4();

        let profiles = Arc::new(InMemoryProfileDirectory::new());
        profiles.add_patient(PatientSummary {
            id: patient_id,
            name: "Ana Perez".to_string(),
            email: Some("ana@example.com".to_string()),
        });
        profiles.add_professional(ProfessionalSummary {
            id: professional_id,
            name: "Dr. Laura Diaz".to_string(),
            specialty: Some("Cardiology".to_string()),
        });

        let store = Arc::new(InMemoryReservationStore::with_slots([
            Slot::new(professional_id, date(), time(10, 0), time(10, 30)),
            Slot::new(professional_id, date(), time(10, 30), time(11, 0)),
        ]));

        let config = AppConfig {
            webhook_url: format!("{}/webhook", server.uri()),
            webhook_secret: SECRET.to_string(),
            webhook_timeout_seconds: 2,
            confirmation_max_retries: 3,
            retry_delay_ms: RETRY_TTL.as_millis() as u64,
            ..AppConfig::default()
        };

        Self {
            server,
            store,
            profiles,
            bus: Arc::new(InMemoryEventBus::new(Topology::appointments(RETRY_TTL))),
            config,
            patient_id,
            professional_id,
        }
    }

    pub fn dyn_bus(&self) -> Arc<dyn EventBus> {
        self.bus.clone()
    }

    pub fn processor(&self) -> ConfirmationProcessor {
        self.processor_with_timeout(Duration::from_secs(2))
    }

    pub fn processor_with_timeout(&self, timeout: Duration) -> ConfirmationProcessor {
        let notifier = HttpNotifier::with_timeout(&self.config.webhook_url, timeout).unwrap();
        ConfirmationProcessor::new(
            self.store.clone(),
            self.profiles.clone(),
            self.dyn_bus(),
            Arc::new(notifier),
            &self.config,
        )
    }

    /// Reserves the 10:00 slot through the booking service, which publishes
    /// the initial `appointment.created` event.
    pub async fn book(&self) -> Appointment {
        let booking =
            AppointmentBookingService::new(self.store.clone(), self.profiles.clone(), self.dyn_bus(), &self.config);
        booking
            .reserve(ReserveRequest {
                patient_id: self.patient_id,
                professional_id: self.professional_id,
                date: date(),
                start_time: time(10, 0),
                end_time: time(10, 30),
                reason: Some("Routine check-up".to_string()),
            })
            .await
            .unwrap()
    }

    pub async fn appointment(&self, id: Uuid) -> Appointment {
        self.store.get_appointment(id).await.unwrap().unwrap()
    }

    /// Takes the next confirmation delivery; waits out the retry TTL if needed.
    pub async fn next_delivery(&self) -> Delivery {
        self.try_next_delivery(Duration::from_secs(2))
            .await
            .expect("expected a confirmation delivery")
    }

    pub async fn try_next_delivery(&self, wait: Duration) -> Option<Delivery> {
        self.bus
            .consume(&[QueueName::Created, QueueName::Retry], "test-consumer", wait)
            .await
            .unwrap()
    }

    /// Runs one delivery through the processor and acks it like the worker does.
    pub async fn process_next(&self, processor: &ConfirmationProcessor) -> Disposition {
        let delivery = self.next_delivery().await;
        let disposition = processor.handle(&delivery).await.unwrap();
        self.bus.ack(&delivery).await.unwrap();
        disposition
    }
}
