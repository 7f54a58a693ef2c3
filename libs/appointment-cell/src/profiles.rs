use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use shared_database::supabase::SupabaseClient;

use crate::models::{PatientSummary, ProfessionalSummary};

/// Existence checks and display fields for patients and professionals.
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn patient(&self, id: Uuid) -> Result<Option<PatientSummary>>;
    async fn professional(&self, id: Uuid) -> Result<Option<ProfessionalSummary>>;
}

#[derive(Debug, Deserialize)]
struct PatientRow {
    id: Uuid,
    first_name: String,
    last_name: String,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProfessionalRow {
    id: Uuid,
    first_name: String,
    last_name: String,
    specialty: Option<String>,
}

fn full_name(first: &str, last: &str) -> String {
    format!("{} {}", first, last).trim().to_string()
}

pub struct SupabaseProfileDirectory {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseProfileDirectory {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }
}

#[async_trait]
impl ProfileDirectory for SupabaseProfileDirectory {
    async fn patient(&self, id: Uuid) -> Result<Option<PatientSummary>> {
        let path = format!("/rest/v1/patients?id=eq.{}&select=id,first_name,last_name,email", id);
        let rows: Vec<PatientRow> = self.supabase.request(Method::GET, &path, None, None).await?;

        let summary = rows.into_iter().next().map(|row| PatientSummary {
            id: row.id,
            name: full_name(&row.first_name, &row.last_name),
            email: row.email,
        });
        if summary.is_none() {
            debug!("Patient {} not found", id);
        }
        Ok(summary)
    }

    async fn professional(&self, id: Uuid) -> Result<Option<ProfessionalSummary>> {
        let path = format!(
            "/rest/v1/professionals?id=eq.{}&select=id,first_name,last_name,specialty",
            id
        );
        let rows: Vec<ProfessionalRow> = self.supabase.request(Method::GET, &path, None, None).await?;

        let summary = rows.into_iter().next().map(|row| ProfessionalSummary {
            id: row.id,
            name: full_name(&row.first_name, &row.last_name),
            specialty: row.specialty,
        });
        if summary.is_none() {
            debug!("Professional {} not found", id);
        }
        Ok(summary)
    }
}

#[derive(Default)]
pub struct InMemoryProfileDirectory {
    patients: RwLock<HashMap<Uuid, PatientSummary>>,
    professionals: RwLock<HashMap<Uuid, ProfessionalSummary>>,
}

impl InMemoryProfileDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_patient(&self, patient: PatientSummary) {
        if let Ok(mut patients) = self.patients.write() {
            patients.insert(patient.id, patient);
        }
    }

    pub fn add_professional(&self, professional: ProfessionalSummary) {
        if let Ok(mut professionals) = self.professionals.write() {
            professionals.insert(professional.id, professional);
        }
    }
}

#[async_trait]
impl ProfileDirectory for InMemoryProfileDirectory {
    async fn patient(&self, id: Uuid) -> Result<Option<PatientSummary>> {
        let patients = self
            .patients
            .read()
            .map_err(|_| anyhow::anyhow!("patient directory lock poisoned"))?;
        Ok(patients.get(&id).cloned())
    }

    async fn professional(&self, id: Uuid) -> Result<Option<ProfessionalSummary>> {
        let professionals = self
            .professionals
            .read()
            .map_err(|_| anyhow::anyhow!("professional directory lock poisoned"))?;
        Ok(professionals.get(&id).cloned())
    }
}
