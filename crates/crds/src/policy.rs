//! Policy CRD
//!
//! A governance policy. The status sync controller only reads the spec; it
//! copies `status` from the managed cluster's copy to the hub's copy.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "policy.open-cluster-management.io",
    version = "v1",
    kind = "Policy",
    plural = "policies",
    shortname = "plc",
    namespaced,
    status = "PolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    /// Disabled policies are not propagated or evaluated
    #[serde(default)]
    pub disabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation_action: Option<RemediationAction>,

    #[serde(rename = "policy-templates", default)]
    pub policy_templates: Vec<PolicyTemplate>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemediationAction {
    #[serde(alias = "Inform")]
    Inform,
    #[serde(alias = "Enforce")]
    Enforce,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTemplate {
    /// Embedded policy object, evaluated by the template's own controller
    #[schemars(extend("x-kubernetes-preserve-unknown-fields" = true))]
    pub object_definition: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ComplianceState {
    Compliant,
    NonCompliant,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliant: Option<ComplianceState>,

    /// Per-template compliance and history
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<DetailsPerTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DetailsPerTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_meta: Option<TemplateMeta>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliant: Option<ComplianceState>,

    /// Most recent first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<ComplianceHistory>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceHistory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub event_name: String,
}
