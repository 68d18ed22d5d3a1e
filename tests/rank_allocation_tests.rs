/// End-to-end rank allocation tests
///
/// Drives the registry's post-step allocation hook across a full schedule
/// and checks the budget trajectory, the finalized mask, and the frozen
/// rank pattern.

#[cfg(test)]
mod tests {
    use ndarray::{array, Array1, Array2};
    use petl_rs::{AdapterConfig, AdapterModel, Error, Module, Projection, RankSchedule};

    const RANK: usize = 4;

    fn schedule() -> RankSchedule {
        RankSchedule {
            tinit: 2,
            tfinal: 6,
            total_step: 12,
            beta1: 0.85,
            beta2: 0.85,
            init_budget: 2 * RANK,
            final_budget: 2,
        }
    }

    fn registry() -> AdapterModel {
        let mut model = Module::container();
        for name in ["q_proj", "v_proj"] {
            model
                .insert(
                    name,
                    Module::Linear(Projection::new(Array2::zeros((4, 4)), None)),
                )
                .unwrap();
        }
        let config = AdapterConfig::svd(
            vec!["q_proj".into(), "v_proj".into()],
            RANK,
            8.0,
            schedule(),
        );
        AdapterModel::new(model, "default", config).unwrap()
    }

    fn push_grads(reg: &mut AdapterModel, grads: [[f32; RANK]; 2]) {
        for (path, grad) in ["q_proj", "v_proj"].iter().zip(grads) {
            let layer = reg
                .model_mut()
                .get_mut(path)
                .unwrap()
                .as_adapted_mut()
                .unwrap();
            // Magnitudes at one so sensitivity reduces to |grad|.
            let unit = layer.unit_mut("default").unwrap().as_svd_mut().unwrap();
            unit.lora_e = Array1::from_elem(RANK, 1.0);
            layer
                .set_e_grad("default", Array1::from_vec(grad.to_vec()))
                .unwrap();
        }
    }

    fn retained_total(reg: &AdapterModel) -> usize {
        ["q_proj", "v_proj"]
            .iter()
            .map(|path| {
                reg.model()
                    .get(path)
                    .unwrap()
                    .as_adapted()
                    .unwrap()
                    .unit("default")
                    .unwrap()
                    .as_svd()
                    .unwrap()
                    .rank_num
            })
            .sum()
    }

    #[test]
    fn test_budget_trajectory_and_final_mask() {
        let mut reg = registry();
        let mut prev_budget = usize::MAX;

        for step in 0..12 {
            push_grads(&mut reg, [[5.0, 1.0, 8.0, 2.0], [0.1, 0.2, 0.1, 0.05]]);
            let budget = reg.update_and_allocate(step).unwrap().unwrap();
            assert!(budget <= prev_budget, "budget increased at step {step}");
            prev_budget = budget;

            if step >= 6 {
                assert_eq!(retained_total(&reg), 2);
            }
        }

        // Importance [5,1,8,2] on q_proj with final budget 2: directions
        // 2 and 0 survive, mask [1,0,1,0].
        let layer = reg.model().get("q_proj").unwrap().as_adapted().unwrap();
        let unit = layer.unit("default").unwrap().as_svd().unwrap();
        assert_eq!(unit.rank_mask, array![1.0, 0.0, 1.0, 0.0]);

        let pattern = reg.rank_pattern().expect("pattern frozen after tfinal");
        assert_eq!(pattern.get("q_proj").unwrap(), &vec![0, 2]);
        assert!(pattern.get("v_proj").is_none() || pattern.get("v_proj").unwrap().is_empty());
    }

    #[test]
    fn test_pattern_identical_across_post_final_steps() {
        let mut reg = registry();
        for step in 0..=6 {
            push_grads(&mut reg, [[5.0, 1.0, 8.0, 2.0], [0.1, 0.2, 0.1, 0.05]]);
            reg.update_and_allocate(step).unwrap();
        }
        let frozen = reg.rank_pattern().unwrap().clone();

        for step in 7..12 {
            // Adversarial gradients must not reopen pruned directions.
            push_grads(&mut reg, [[0.0, 99.0, 0.0, 99.0], [99.0, 0.0, 99.0, 0.0]]);
            reg.update_and_allocate(step).unwrap();
            assert_eq!(reg.rank_pattern().unwrap(), &frozen);
            assert_eq!(retained_total(&reg), 2);
        }
    }

    #[test]
    fn test_final_budget_exceeding_capacity_rejected_at_setup() {
        let mut model = Module::container();
        model
            .insert(
                "q_proj",
                Module::Linear(Projection::new(Array2::zeros((4, 4)), None)),
            )
            .unwrap();
        let mut s = schedule();
        s.init_budget = 64;
        s.final_budget = 32; // single unit of rank 4 cannot satisfy this
        let config = AdapterConfig::svd(vec!["q_proj".into()], RANK, 8.0, s);
        let err = AdapterModel::new(model, "default", config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_allocation_absent_without_schedule() {
        let mut model = Module::container();
        model
            .insert(
                "q_proj",
                Module::Linear(Projection::new(Array2::zeros((4, 4)), None)),
            )
            .unwrap();
        let config = AdapterConfig::low_rank(vec!["q_proj".into()], 4, 8.0);
        let mut reg = AdapterModel::new(model, "default", config).unwrap();
        assert_eq!(reg.update_and_allocate(0).unwrap(), None);
    }

    #[test]
    fn test_orth_regularization_positive_for_random_factors() {
        let reg = registry();
        // Fresh SVD factors are N(0, 0.02) and nowhere near orthonormal.
        let penalty = reg.orth_regularization().unwrap();
        assert!(penalty > 0.0);
    }
}
