//! Configuration types shared between the ResNet crates.

mod train;
mod types;

pub use train::*;
pub use types::*;

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(Arch::Resnet18, [2, 2, 2, 2], BlockKind::Basic ; "resnet18")]
    #[test_case(Arch::Resnet34, [3, 4, 6, 3], BlockKind::Basic ; "resnet34")]
    #[test_case(Arch::Resnet50, [3, 4, 6, 3], BlockKind::Bottleneck ; "resnet50")]
    #[test_case(Arch::Resnet101, [3, 4, 23, 3], BlockKind::Bottleneck ; "resnet101")]
    #[test_case(Arch::Resnet152, [3, 8, 36, 3], BlockKind::Bottleneck ; "resnet152")]
    fn test_arch_presets(arch: Arch, layers: [usize; 4], block: BlockKind) {
        assert_eq!(arch.layers(), layers);
        assert_eq!(arch.block(), block);
    }

    #[test]
    fn test_feature_dim() {
        assert_eq!(Arch::Resnet18.feature_dim(), 512);
        assert_eq!(Arch::Resnet50.feature_dim(), 2048);
    }

    #[test]
    fn test_arch_from_str() {
        assert_eq!("resnet50".parse::<Arch>().unwrap(), Arch::Resnet50);
        assert_eq!("ResNet-101".parse::<Arch>().unwrap(), Arch::Resnet101);
        assert_eq!("18".parse::<Arch>().unwrap(), Arch::Resnet18);
        assert!("vgg16".parse::<Arch>().is_err());
        for arch in Arch::ALL {
            assert_eq!(arch.to_string().parse::<Arch>().unwrap(), arch);
        }
    }

    #[test]
    fn test_enum_serde() {
        assert_eq!(
            serde_json::from_str::<Arch>("\"resnet34\"").unwrap(),
            Arch::Resnet34
        );
        assert_eq!(serde_json::from_str::<DType>("\"bf16\"").unwrap(), DType::BF16);
        assert_eq!(serde_json::to_string(&Arch::Resnet152).unwrap(), "\"resnet152\"");
    }

    #[test]
    fn test_train_params_default() {
        let params = TrainParams::default();
        assert_eq!(params.model.arch, Arch::Resnet18);
        assert_eq!(params.model.num_classes, 1000);
        assert_eq!(params.train.batch, 128);
        assert_eq!(params.train.epochs, 600);
        assert_eq!(params.data.image_size, 224);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_restart_period() {
        let mut train = TrainConfig {
            epochs: 600,
            ..Default::default()
        };
        assert_eq!(train.restart_period(), 150);
        train.epochs = 2;
        assert_eq!(train.restart_period(), 1);
        train.lr_t0 = Some(7);
        assert_eq!(train.restart_period(), 7);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut params = TrainParams::default();
        params.train.ema_decay = 1.5;
        assert!(matches!(params.validate(), Err(ConfigError::Invalid(_))));

        let mut params = TrainParams::default();
        params.data.std = vec![0.2, 0.2];
        assert!(params.validate().is_err());

        let mut params = TrainParams::default();
        params.train.lr_t_mult = 0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_toml_experiment_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exp.toml");
        std::fs::write(
            &path,
            r#"
arch = "resnet50"
num_classes = 10
epochs = 90
batch = 64
train_dir = "/data/train"
"#,
        )
        .unwrap();

        let params = TrainParams::from_toml_file(&path).unwrap();
        assert_eq!(params.model.arch, Arch::Resnet50);
        assert_eq!(params.model.num_classes, 10);
        assert_eq!(params.train.epochs, 90);
        assert_eq!(params.train.batch, 64);
        assert_eq!(params.data.train_dir, "/data/train");
        // untouched keys keep defaults
        assert_eq!(params.train.lr, 0.1);
    }

    #[test]
    fn test_overlay_only_applies_changed_flags() {
        let file = TrainParams {
            model: ModelParams::new(Arch::Resnet50, 10),
            train: TrainConfig {
                epochs: 90,
                ..Default::default()
            },
            ..Default::default()
        };
        let cli = TrainParams {
            train: TrainConfig {
                batch: 32,
                ..Default::default()
            },
            ..Default::default()
        };

        let merged = file.overlay(&cli).unwrap();
        assert_eq!(merged.model.arch, Arch::Resnet50);
        assert_eq!(merged.model.num_classes, 10);
        assert_eq!(merged.train.epochs, 90);
        assert_eq!(merged.train.batch, 32);
    }

    #[test]
    fn test_merge_json_nested() {
        let base = serde_json::json!({"a": {"b": 1, "c": 2}, "d": 3});
        let overlay = serde_json::json!({"a": {"c": 5}});
        let merged = merge_json(base, overlay);
        assert_eq!(merged, serde_json::json!({"a": {"b": 1, "c": 5}, "d": 3}));
    }

    #[test_case(DType::F32, None, false ; "f32 default")]
    #[test_case(DType::F16, None, true ; "f16 default")]
    #[test_case(DType::BF16, Some(false), false ; "bf16 disabled")]
    #[test_case(DType::F16, Some(true), true ; "f16 enabled")]
    fn test_loss_scaling_follows_dtype(dtype: DType, amp: Option<bool>, expected: bool) {
        let mut params = TrainParams {
            dtype,
            ..Default::default()
        };
        params.train.amp = amp;
        assert!(params.validate().is_ok());
        assert_eq!(params.loss_scaling(), expected);
    }

    #[test]
    fn test_amp_with_f32_is_rejected() {
        let mut params = TrainParams::default();
        params.train.amp = Some(true);
        assert!(matches!(params.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_dtype_is_half() {
        assert!(!DType::F32.is_half());
        assert!(DType::F16.is_half());
        assert!(DType::BF16.is_half());
    }
}
