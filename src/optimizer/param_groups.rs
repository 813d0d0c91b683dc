//! Weight-decay parameter groups.

use crate::model::ParamMeta;
use numr::tensor::TensorId;

/// Trainable parameters split by whether weight decay applies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamGroups {
    pub decay: Vec<TensorId>,
    pub no_decay: Vec<TensorId>,
}

impl ParamGroups {
    pub fn len(&self) -> usize {
        self.decay.len() + self.no_decay.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split trainable parameters into decay and no-decay groups, keeping the
/// canonical order within each. Biases and normalization weights get no decay;
/// frozen parameters are left out entirely.
pub fn param_groups(params: &[ParamMeta]) -> ParamGroups {
    let mut groups = ParamGroups::default();
    for p in params.iter().filter(|p| p.requires_grad) {
        if p.decays() {
            groups.decay.push(p.id);
        } else {
            groups.no_decay.push(p.id);
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_groups_split() {
        let ids: Vec<TensorId> = (0..4).map(|_| TensorId::new()).collect();
        let metas = vec![
            ParamMeta::new("encoder.layers.0.self_attention.query_key_value.weight", ids[0]),
            ParamMeta::new("encoder.layers.0.self_attention.query_key_value.bias", ids[1]),
            ParamMeta::new("encoder.final_layernorm.weight", ids[2]),
            ParamMeta::new("encoder.embedding.position_embeddings.weight", ids[3]).frozen(),
        ];
        let groups = param_groups(&metas);
        assert_eq!(groups.decay, vec![ids[0]]);
        assert_eq!(groups.no_decay, vec![ids[1], ids[2]]);
        assert_eq!(groups.len(), 3);
        assert!(param_groups(&[]).is_empty());
    }
}
