//! Model string resolution: `provider/model`, aliases, combos.

use omniroute_provider_core::{MachineRecord, ProviderKind, alias_to_provider};

use crate::error::GatewayError;

const MAX_ALIAS_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedModel {
    Single { provider: ProviderKind, model: String },
    /// Ordered candidate list from a combo; each entry is a fully qualified
    /// `alias/model` string.
    Combo { name: String, models: Vec<String> },
}

pub fn resolve_model(record: &MachineRecord, model_string: &str) -> Result<ResolvedModel, GatewayError> {
    resolve_at_depth(record, model_string, 0)
}

fn resolve_at_depth(
    record: &MachineRecord,
    model_string: &str,
    depth: usize,
) -> Result<ResolvedModel, GatewayError> {
    if depth > MAX_ALIAS_DEPTH {
        return Err(GatewayError::invalid_request(format!(
            "model alias chain too deep at {model_string}"
        )));
    }

    if let Some((provider_alias, model)) = model_string.split_once('/') {
        let provider = alias_to_provider(provider_alias).ok_or_else(|| {
            GatewayError::invalid_request(format!("unknown provider alias {provider_alias}"))
        })?;
        if model.is_empty() {
            return Err(GatewayError::invalid_request("invalid model format"));
        }
        return Ok(ResolvedModel::Single {
            provider,
            model: model.to_string(),
        });
    }

    if let Some(target) = record.model_aliases.get(model_string) {
        return resolve_at_depth(record, target, depth + 1);
    }

    if let Some(combo) = record.combos.iter().find(|combo| combo.name == model_string) {
        return Ok(ResolvedModel::Combo {
            name: combo.name.clone(),
            models: combo.models.clone(),
        });
    }

    Err(GatewayError::invalid_request("invalid model format"))
}
