//! Service configuration. Every section has serde defaults, so an empty
//! file or no file at all yields a runnable service; `ATTRITION__...`
//! environment variables override single keys.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::audit::AuditSettings;
use crate::drift::DriftSettings;
use crate::gate::PromotionThresholds;
use crate::schema::{FeatureDescriptor, FeatureSchema};
use crate::search::SearchSettings;
use crate::store::StoreSettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingSettings {
    pub bind: String,
    pub inference_log_capacity: usize,
    /// Consecutive artifact load failures before loads are paused.
    pub load_failure_threshold: u32,
    pub load_retry_secs: u64,
}

impl Default for ServingSettings {
    fn default() -> Self { Self { bind: "0.0.0.0:8080".into(), inference_log_capacity: 20_000, load_failure_threshold: 3, load_retry_secs: 30 } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    /// JSON array of training records; the service starts without a model
    /// when unset.
    pub training_file: Option<PathBuf>,
    pub schema: FeatureSchema,
}

impl Default for DataSettings {
    fn default() -> Self { Self { training_file: None, schema: attrition_schema() } }
}

/// The HR attrition table: employee attributes with a yes/no `Attrition` target.
pub fn attrition_schema() -> FeatureSchema {
    use FeatureDescriptor as F;
    FeatureSchema {
        features: vec![
            F::numeric("Age"),
            F::categorical("BusinessTravel"),
            F::numeric("DailyRate"),
            F::categorical("Department"),
            F::numeric("DistanceFromHome"),
            F::ordinal("Education"),
            F::categorical("EducationField"),
            F::ordinal("EnvironmentSatisfaction"),
            F::categorical("Gender"),
            F::ordinal("JobInvolvement"),
            F::ordinal("JobLevel"),
            F::categorical("JobRole"),
            F::ordinal("JobSatisfaction"),
            F::categorical("MaritalStatus"),
            F::numeric("MonthlyIncome"),
            F::numeric("NumCompaniesWorked"),
            F::categorical("OverTime"),
            F::numeric("PercentSalaryHike"),
            F::ordinal("StockOptionLevel"),
            F::numeric("TotalWorkingYears"),
            F::ordinal("WorkLifeBalance"),
            F::numeric("YearsAtCompany"),
            F::numeric("YearsSinceLastPromotion"),
        ],
        target: "Attrition".into(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub search: SearchSettings,
    pub audit: AuditSettings,
    pub thresholds: PromotionThresholds,
    pub drift: DriftSettings,
    pub serving: ServingSettings,
    pub store: StoreSettings,
    pub data: DataSettings,
}

impl GovernanceConfig {
    /// Gate thresholds with every configured protected attribute required
    /// in the fairness report.
    pub fn promotion_thresholds(&self) -> PromotionThresholds {
        let mut t = self.thresholds.clone();
        for a in &self.audit.protected_attributes {
            if !t.required_attributes.contains(a) { t.required_attributes.push(a.clone()); }
        }
        t
    }

    /// Cross-section checks the individual defaults cannot express.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::GovernanceError::InvalidInput;
        self.thresholds.validate()?;
        let schema = FeatureSchema::new(self.data.schema.features.clone(), &self.data.schema.target)?;
        let mut attributes = self.audit.protected_attributes.iter().chain(&self.thresholds.required_attributes);
        if let Some(a) = attributes.find(|a| schema.descriptor(a).is_none()) {
            return Err(InvalidInput(format!("protected attribute `{a}` is not in the schema")));
        }
        if !(self.drift.significance_level > 0.0 && self.drift.significance_level < 1.0) {
            return Err(InvalidInput(format!("drift significance {} outside (0, 1)", self.drift.significance_level)));
        }
        Ok(())
    }
}
