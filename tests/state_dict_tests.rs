/// Adapter state-dict save/load tests
///
/// Round-trips one adapter's parameters through the flat path->tensor
/// mapping, including legacy-layout key remapping.

#[cfg(test)]
mod tests {
    use ndarray::{array, Array2};
    use petl_rs::{
        load_adapter, save_adapter, strip_legacy_prefixes, AdapterConfig, AdapterModel, Error,
        Module, Projection, RankSchedule, StateDict, TensorValue, Unit,
    };

    fn toy_model() -> Module {
        let mut attn = Module::container();
        attn.insert(
            "q_proj",
            Module::Linear(Projection::new(Array2::zeros((2, 3)), None)),
        )
        .unwrap();
        let mut model = Module::container();
        model.insert("attn", attn).unwrap();
        model
    }

    fn lora_registry() -> AdapterModel {
        AdapterModel::new(
            toy_model(),
            "default",
            AdapterConfig::low_rank(vec!["q_proj".into()], 2, 4.0),
        )
        .unwrap()
    }

    #[test]
    fn test_save_uses_canonical_paths() {
        let reg = lora_registry();
        let dict = save_adapter(&reg, "default").unwrap();
        let keys: Vec<&String> = dict.keys().collect();
        assert_eq!(
            keys,
            vec![
                "base_model.model.attn.q_proj.lora_A.default",
                "base_model.model.attn.q_proj.lora_B.default",
            ]
        );
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut source = lora_registry();
        {
            let layer = source
                .model_mut()
                .get_mut("attn.q_proj")
                .unwrap()
                .as_adapted_mut()
                .unwrap();
            match layer.unit_mut("default").unwrap() {
                Unit::Lora(u) => {
                    u.lora_a = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
                    u.lora_b = array![[7.0, 8.0], [9.0, 10.0]];
                }
                _ => unreachable!(),
            }
        }
        let dict = save_adapter(&source, "default").unwrap();

        let mut target = lora_registry();
        let loaded = load_adapter(&mut target, "default", &dict, None).unwrap();
        assert_eq!(loaded, 2);

        let layer = target
            .model()
            .get("attn.q_proj")
            .unwrap()
            .as_adapted()
            .unwrap();
        match layer.unit("default").unwrap() {
            Unit::Lora(u) => {
                assert_eq!(u.lora_a, array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
                assert_eq!(u.lora_b, array![[7.0, 8.0], [9.0, 10.0]]);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_load_with_legacy_remap() {
        let source = lora_registry();
        let canonical = save_adapter(&source, "default").unwrap();

        // Simulate a checkpoint written by a distributed-training wrapper.
        let mut legacy = StateDict::new();
        for (key, value) in &canonical {
            let stripped = key.strip_prefix("base_model.model.").unwrap();
            legacy.insert(format!("module.{stripped}"), value.clone());
        }

        let mut target = lora_registry();
        // Without remapping, no keys match the canonical layout.
        assert_eq!(
            load_adapter(&mut target, "default", &legacy, None).unwrap(),
            0
        );
        let loaded =
            load_adapter(&mut target, "default", &legacy, Some(&strip_legacy_prefixes)).unwrap();
        assert_eq!(loaded, 2);
    }

    #[test]
    fn test_load_shape_mismatch_is_fatal() {
        let mut target = lora_registry();
        let mut dict = StateDict::new();
        dict.insert(
            "base_model.model.attn.q_proj.lora_A.default".to_string(),
            TensorValue::Matrix(Array2::zeros((5, 5))),
        );
        let err = load_adapter(&mut target, "default", &dict, None).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_load_ignores_other_adapters() {
        let mut target = lora_registry();
        let mut dict = StateDict::new();
        dict.insert(
            "base_model.model.attn.q_proj.lora_A.other".to_string(),
            TensorValue::Matrix(Array2::zeros((2, 3))),
        );
        assert_eq!(load_adapter(&mut target, "default", &dict, None).unwrap(), 0);
    }

    fn svd_registry() -> AdapterModel {
        let schedule = RankSchedule {
            tinit: 1,
            tfinal: 2,
            total_step: 4,
            beta1: 0.85,
            beta2: 0.85,
            init_budget: 2,
            final_budget: 1,
        };
        AdapterModel::new(
            toy_model(),
            "default",
            AdapterConfig::svd(vec!["q_proj".into()], 2, 4.0, schedule),
        )
        .unwrap()
    }

    #[test]
    fn test_svd_state_dict_includes_magnitudes_and_mask() {
        let reg = svd_registry();
        let dict = save_adapter(&reg, "default").unwrap();
        assert!(dict.contains_key("base_model.model.attn.q_proj.lora_E.default"));
        assert!(dict.contains_key("base_model.model.attn.q_proj.rank_mask.default"));
        assert_eq!(dict.len(), 4);
    }

    #[test]
    fn test_round_trip_preserves_pruning() {
        let mut source = svd_registry();
        {
            let layer = source
                .model_mut()
                .get_mut("attn.q_proj")
                .unwrap()
                .as_adapted_mut()
                .unwrap();
            let unit = layer.unit_mut("default").unwrap().as_svd_mut().unwrap();
            unit.lora_a = array![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
            unit.lora_e = array![2.0, 3.0];
            unit.lora_b = array![[1.0, 0.0], [0.0, 1.0]];
            unit.set_rank_mask(array![1.0, 0.0]).unwrap();
        }
        let x = array![[1.0, 1.0, 1.0]];
        let source_layer = source
            .model()
            .get("attn.q_proj")
            .unwrap()
            .as_adapted()
            .unwrap();
        let expected = source_layer.forward(&x, false).unwrap();
        let dict = save_adapter(&source, "default").unwrap();

        let mut target = svd_registry();
        assert_eq!(load_adapter(&mut target, "default", &dict, None).unwrap(), 4);

        let layer = target
            .model()
            .get("attn.q_proj")
            .unwrap()
            .as_adapted()
            .unwrap();
        let unit = layer.unit("default").unwrap().as_svd().unwrap();
        assert_eq!(unit.rank_mask, array![1.0, 0.0]);
        assert_eq!(unit.rank_num, 1);
        // Pruned directions must not contribute again after the reload.
        assert_eq!(layer.forward(&x, false).unwrap(), expected);
    }

    #[test]
    fn test_unknown_adapter_rejected() {
        let reg = lora_registry();
        assert!(matches!(
            save_adapter(&reg, "missing"),
            Err(Error::UnknownAdapter(_))
        ));
    }
}
