//! Eligibility filter applied to the provider's instance quotas

use cloud_api::InstanceConfig;

use crate::storage::settings::EligibilitySettings;

#[derive(Debug, Clone)]
pub struct EligibilityPolicy {
    pub families: Vec<String>,
    pub cpu: u32,
    pub memory_gb: u32,
    pub min_bandwidth: f64,
    pub min_price: f64,
    pub max_price: f64,
}

impl EligibilityPolicy {
    pub fn admits(&self, config: &InstanceConfig) -> bool {
        let price = config.price.unit_price_discount;
        config.is_on_sale()
            && config.is_hourly()
            && self
                .families
                .iter()
                .any(|family| config.instance_family.starts_with(family.as_str()))
            && config.cpu == self.cpu
            && config.memory == self.memory_gb
            && config.instance_bandwidth >= self.min_bandwidth
            && price >= self.min_price
            && price <= self.max_price
    }

    pub fn filter(&self, configs: Vec<InstanceConfig>) -> Vec<InstanceConfig> {
        configs.into_iter().filter(|c| self.admits(c)).collect()
    }
}

impl From<&EligibilitySettings> for EligibilityPolicy {
    fn from(settings: &EligibilitySettings) -> Self {
        let [low, high] = settings.hour_price_range;
        Self {
            families: settings.families.clone(),
            cpu: settings.cpu,
            memory_gb: settings.memory_gb,
            min_bandwidth: settings.min_bandwidth,
            min_price: low.min(high),
            max_price: low.max(high),
        }
    }
}

impl Default for EligibilityPolicy {
    fn default() -> Self {
        Self::from(&EligibilitySettings::default())
    }
}
