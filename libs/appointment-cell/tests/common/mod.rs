#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use uuid::Uuid;

use appointment_cell::*;
use event_bus_cell::{EventBus, InMemoryEventBus, Topology};
use shared_config::AppConfig;

pub struct Fixture {
    pub store: Arc<InMemoryReservationStore>,
    pub profiles: Arc<InMemoryProfileDirectory>,
    pub bus: Arc<InMemoryEventBus>,
    pub config: Arc<AppConfig>,
    pub patient_id: Uuid,
    pub other_patient_id: Uuid,
    pub professional_id: Uuid,
    pub slot: Slot,
}

pub fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
}

pub fn time(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(AppConfig::default())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let patient_id = Uuid::new_v4();
        let other_patient_id = Uuid::new_v4();
        let professional_id = Uuid::new_v4();

        let profiles = Arc::new(InMemoryProfileDirectory::new());
        for (id, name) in [(patient_id, "Ana Perez"), (other_patient_id, "Luis Gomez")] {
            profiles.add_patient(PatientSummary {
                id,
                name: name.to_string(),
                email: Some(format!("{}@example.com", id)),
            });
        }
        profiles.add_professional(ProfessionalSummary {
            id: professional_id,
            name: "Dr. Laura Diaz".to_string(),
            specialty: Some("Cardiology".to_string()),
        });

        let slot = Slot::new(professional_id, date(), time(10, 0), time(10, 30));
        let later = Slot::new(professional_id, date(), time(10, 30), time(11, 0));
        let store = Arc::new(InMemoryReservationStore::with_slots([slot.clone(), later]));

        let bus = Arc::new(InMemoryEventBus::new(Topology::appointments(Duration::from_millis(
            config.retry_delay_ms,
        ))));

        Self {
            store,
            profiles,
            bus,
            config: Arc::new(config),
            patient_id,
            other_patient_id,
            professional_id,
            slot,
        }
    }

    pub fn dyn_store(&self) -> Arc<dyn ReservationStore> {
        self.store.clone()
    }

    pub fn dyn_profiles(&self) -> Arc<dyn ProfileDirectory> {
        self.profiles.clone()
    }

    pub fn dyn_bus(&self) -> Arc<dyn EventBus> {
        self.bus.clone()
    }

    pub fn booking(&self) -> AppointmentBookingService {
        AppointmentBookingService::new(self.dyn_store(), self.dyn_profiles(), self.dyn_bus(), &self.config)
    }

    pub fn lifecycle(&self) -> AppointmentLifecycleService {
        AppointmentLifecycleService::new(self.dyn_store(), self.dyn_bus())
    }

    pub fn availability(&self) -> AvailabilityService {
        AvailabilityService::new(self.dyn_store(), self.dyn_profiles())
    }

    pub fn cell_state(&self) -> Arc<AppointmentCellState> {
        Arc::new(AppointmentCellState::new(
            self.config.clone(),
            self.dyn_store(),
            self.dyn_profiles(),
            self.dyn_bus(),
        ))
    }

    pub fn request(&self, patient_id: Uuid) -> ReserveRequest {
        ReserveRequest {
            patient_id,
            professional_id: self.professional_id,
            date: self.slot.date,
            start_time: self.slot.start_time,
            end_time: self.slot.end_time,
            reason: Some("Routine check-up".to_string()),
        }
    }
}
