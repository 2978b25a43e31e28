//! Audit entry types
//!
//! An [`Entry`] is built by the service, shaped by the option pipeline,
//! redacted by the sensitive-data manager and then handed to storage. Once it
//! has been admitted to the pipeline nothing rewrites it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{Error, Result};
use crate::ids::{CorrelationId, EntryId};

/// A string-keyed map of arbitrarily nested JSON values.
pub type DataMap = serde_json::Map<String, Value>;

/// Kind of domain object an entry describes.
///
/// Redaction rules are registered per resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    User,
    BusinessUnit,
    Organization,
    DocumentQualityConfig,
    Worker,
    Tractor,
    Trailer,
    Shipment,
    Assignment,
    ShipmentMove,
    FleetCode,
    EquipmentType,
    EquipmentManufacturer,
    ShipmentType,
    ServiceType,
    HazardousMaterial,
    Commodity,
    LocationCategory,
    Location,
    Customer,
    Invoice,
    Dispatch,
    Report,
    AuditLog,
    TableConfiguration,
    Integration,
    Setting,
    Template,
}

impl Resource {
    /// The snake_case tag stored with each entry.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::BusinessUnit => "business_unit",
            Self::Organization => "organization",
            Self::DocumentQualityConfig => "document_quality_config",
            Self::Worker => "worker",
            Self::Tractor => "tractor",
            Self::Trailer => "trailer",
            Self::Shipment => "shipment",
            Self::Assignment => "assignment",
            Self::ShipmentMove => "shipment_move",
            Self::FleetCode => "fleet_code",
            Self::EquipmentType => "equipment_type",
            Self::EquipmentManufacturer => "equipment_manufacturer",
            Self::ShipmentType => "shipment_type",
            Self::ServiceType => "service_type",
            Self::HazardousMaterial => "hazardous_material",
            Self::Commodity => "commodity",
            Self::LocationCategory => "location_category",
            Self::Location => "location",
            Self::Customer => "customer",
            Self::Invoice => "invoice",
            Self::Dispatch => "dispatch",
            Self::Report => "report",
            Self::AuditLog => "audit_log",
            Self::TableConfiguration => "table_configuration",
            Self::Integration => "integration",
            Self::Setting => "setting",
            Self::Template => "template",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    Approve,
    Reject,
    Submit,
    Cancel,
    Assign,
    Reassign,
    Complete,
    Duplicate,
    Copy,
    Share,
    Export,
    Import,
    Archive,
    Restore,
    Configure,
}

impl Operation {
    /// The snake_case tag stored with each entry.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Submit => "submit",
            Self::Cancel => "cancel",
            Self::Assign => "assign",
            Self::Reassign => "reassign",
            Self::Complete => "complete",
            Self::Duplicate => "duplicate",
            Self::Copy => "copy",
            Self::Share => "share",
            Self::Export => "export",
            Self::Import => "import",
            Self::Archive => "archive",
            Self::Restore => "restore",
            Self::Configure => "configure",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse grouping used by downstream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    #[default]
    System,
    Configuration,
    Operations,
    Security,
}

impl Category {
    /// The snake_case tag stored with each entry.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Configuration => "configuration",
            Self::Operations => "operations",
            Self::Security => "security",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Display snapshot of the acting user, captured at write time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSnapshot {
    pub id: String,
    #[serde(default)]
    pub business_unit_id: String,
    #[serde(default)]
    pub current_organization_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email_address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub profile_pic_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thumbnail_url: String,
}

/// A single audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Unique entry identifier
    pub id: EntryId,
    /// Opaque identifier of the audited object
    pub resource_id: String,
    /// Kind of the audited object
    pub resource: Resource,
    /// What happened
    pub operation: Operation,
    /// Acting user
    pub user_id: String,
    /// Tenant organization
    pub organization_id: String,
    /// Tenant business unit
    pub business_unit_id: String,
    /// Joins the entries of one multi-step workflow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Seconds since the Unix epoch
    pub timestamp: i64,
    #[serde(default)]
    pub previous_state: DataMap,
    #[serde(default)]
    pub current_state: DataMap,
    /// Keyed by dotted field path; each value carries at least `from` and `to`
    #[serde(default)]
    pub changes: DataMap,
    #[serde(default)]
    pub metadata: DataMap,
    #[serde(default)]
    pub category: Category,
    /// Selects the synchronous write path
    #[serde(default)]
    pub critical: bool,
    /// Set when redaction modified any field
    #[serde(default)]
    pub sensitive_data: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSnapshot>,
}

impl Entry {
    /// Create an entry with a fresh ID, the current timestamp and empty data maps.
    pub fn new(
        resource: Resource,
        resource_id: impl Into<String>,
        operation: Operation,
        user_id: impl Into<String>,
        organization_id: impl Into<String>,
        business_unit_id: impl Into<String>,
    ) -> Self {
        Self {
            id: EntryId::new(),
            resource_id: resource_id.into(),
            resource,
            operation,
            user_id: user_id.into(),
            organization_id: organization_id.into(),
            business_unit_id: business_unit_id.into(),
            correlation_id: None,
            timestamp: chrono::Utc::now().timestamp(),
            previous_state: DataMap::new(),
            current_state: DataMap::new(),
            changes: DataMap::new(),
            metadata: DataMap::new(),
            category: Category::default(),
            critical: false,
            sensitive_data: false,
            user_agent: String::new(),
            ip_address: String::new(),
            comment: String::new(),
            user: None,
        }
    }

    /// Check the fields every stored entry must carry.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.id.is_empty() {
            missing.push("id");
        }
        if self.resource_id.trim().is_empty() {
            missing.push("resourceId");
        }
        if self.user_id.trim().is_empty() {
            missing.push("userId");
        }
        if self.organization_id.trim().is_empty() {
            missing.push("organizationId");
        }
        if self.business_unit_id.trim().is_empty() {
            missing.push("businessUnitId");
        }

        if !missing.is_empty() {
            return Err(Error::InvalidEntry(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }
        if self.timestamp <= 0 {
            return Err(Error::InvalidEntry(format!(
                "timestamp must be positive, got {}",
                self.timestamp
            )));
        }
        Ok(())
    }
}
