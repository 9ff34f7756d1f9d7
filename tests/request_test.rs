//! Request normalization against model configurations: batch derivation,
//! shape checks, reshape propagation, and the two batch conventions.

mod common;

use std::sync::Arc;

use common::*;
use keel::{
    BackendHandle, BatchConvention, DataType, DynamicBatching, Error, InferenceRequest,
    Input, ModelConfig, WILDCARD_DIM,
};

fn handle(config: ModelConfig) -> BackendHandle {
    BackendHandle::new(
        config.name.clone(),
        1,
        config,
        Arc::new(RecordingExecutor::default()),
    )
}

fn add_sub_request(shape: &[i64], elements: usize) -> InferenceRequest {
    let values: Vec<i32> = (0..elements as i32).collect();
    let mut request = InferenceRequest::new("m");
    request
        .add_original_input(int32_input("INPUT0", shape, &values))
        .unwrap();
    request
        .add_original_input(int32_input("INPUT1", shape, &values))
        .unwrap();
    request
}

#[test]
fn leading_dimension_strips_batch() {
    let backend = handle(add_sub_config("m", 8, &[4]));
    let mut request = add_sub_request(&[2, 4], 8);

    request.prepare(&backend).unwrap();

    assert_eq!(request.batch_size(), 2);
    for input in request.inputs() {
        assert_eq!(input.original_shape(), &[2, 4]);
        assert_eq!(input.shape(), &[4]);
        assert_eq!(input.data_type(), Some(DataType::Int32));
        assert_eq!(input.batch_byte_size(), 32);
    }
}

#[test]
fn non_batching_model_keeps_shapes() {
    let backend = handle(add_sub_config("m", 0, &[4]));
    let mut request = add_sub_request(&[4], 4);

    request.prepare(&backend).unwrap();

    assert_eq!(request.batch_size(), 1);
    for input in request.inputs() {
        assert_eq!(input.shape(), input.original_shape());
    }
}

#[test]
fn batch_size_bounds() {
    let backend = handle(add_sub_config("m", 8, &[4]));

    // batch == max accepted
    let mut at_max = add_sub_request(&[8, 4], 32);
    at_max.prepare(&backend).unwrap();
    assert_eq!(at_max.batch_size(), 8);

    // batch == max + 1 rejected
    let mut over = add_sub_request(&[9, 4], 36);
    let err = over.prepare(&backend).unwrap_err();
    assert!(err.to_string().contains("must be <= 8"), "{err}");

    // batch == 0 rejected
    let mut zero = add_sub_request(&[0, 4], 0);
    let err = zero.prepare(&backend).unwrap_err();
    assert!(err.to_string().contains("must be >= 1"), "{err}");
}

#[test]
fn mismatched_batch_dims_rejected() {
    let backend = handle(add_sub_config("m", 8, &[4]));
    let mut request = InferenceRequest::new("m");
    request
        .add_original_input(int32_input("INPUT0", &[2, 4], &[0; 8]))
        .unwrap();
    request
        .add_original_input(int32_input("INPUT1", &[3, 4], &[0; 12]))
        .unwrap();

    let err = request.prepare(&backend).unwrap_err();
    assert!(
        err.to_string().contains("batch size does not match"),
        "{err}"
    );
}

#[test]
fn reshape_rewrites_working_shape() {
    // dims [-1,3] with reshape [3,-1]: a [4,3] request becomes [3,4].
    let mut config = add_sub_config("m", 0, &[WILDCARD_DIM, 3]);
    for tensor in config.input.iter_mut() {
        *tensor = reshaped(tensor.clone(), &[3, WILDCARD_DIM]);
    }
    let backend = handle(config);

    let mut request = add_sub_request(&[4, 3], 12);
    request.prepare(&backend).unwrap();

    for input in request.inputs() {
        assert_eq!(input.original_shape(), &[4, 3]);
        assert_eq!(input.shape(), &[3, 4]);
    }
}

#[test]
fn unexpected_shape_is_invalid_arg() {
    let backend = handle(add_sub_config("m", 0, &[4]));
    let mut request = add_sub_request(&[5], 5);
    let err = request.prepare(&backend).unwrap_err();
    assert!(err.to_string().contains("unexpected shape"), "{err}");
    assert!(err.to_string().contains("Expected [4], got [5]"), "{err}");
}

#[test]
fn negative_request_dim_requires_concrete_shape() {
    let backend = handle(add_sub_config("m", 0, &[WILDCARD_DIM]));
    let mut request = add_sub_request(&[-1], 0);
    let err = request.prepare(&backend).unwrap_err();
    assert!(
        err.to_string().contains("request must specify input shape"),
        "{err}"
    );
}

#[test]
fn unknown_requested_output_is_not_found() {
    let backend = handle(add_sub_config("m", 0, &[4]));
    let mut request = add_sub_request(&[4], 4);
    request.add_requested_output("GHOST", 0).unwrap();
    let err = request.prepare(&backend).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "{err}");
}

#[test]
fn wrong_input_count_is_invalid_arg() {
    let backend = handle(add_sub_config("m", 0, &[4]));
    let mut request = InferenceRequest::new("m");
    request
        .add_original_input(int32_input("INPUT0", &[4], &[0; 4]))
        .unwrap();
    let err = request.prepare(&backend).unwrap_err();
    assert!(
        err.to_string().contains("expected 2 inputs but got 1"),
        "{err}"
    );
}

#[test]
fn request_level_convention_cross_validates_byte_size() {
    let config = with_convention(
        add_sub_config("m", 8, &[4]),
        BatchConvention::RequestLevel,
    );
    let backend = handle(config);

    // Shapes carry no batch dimension; the batch size is request-level.
    let mut request = InferenceRequest::new("m");
    request
        .add_original_input(
            Input::new("INPUT0", &[4]).with_batch_byte_size(32),
        )
        .unwrap();
    request
        .add_original_input(
            Input::new("INPUT1", &[4]).with_batch_byte_size(32),
        )
        .unwrap();
    request.set_batch_size(2);
    request.prepare(&backend).unwrap();

    for input in request.inputs() {
        assert_eq!(input.shape(), &[4]);
        assert_eq!(input.batch_byte_size(), 32);
    }

    // A caller-supplied byte size that disagrees with shape and datatype is
    // rejected.
    let mut bad = InferenceRequest::new("m");
    bad.add_original_input(Input::new("INPUT0", &[4]).with_batch_byte_size(31))
        .unwrap();
    bad.add_original_input(Input::new("INPUT1", &[4]).with_batch_byte_size(32))
        .unwrap();
    bad.set_batch_size(2);
    let err = bad.prepare(&backend).unwrap_err();
    assert!(
        err.to_string().contains("batch-byte-size for input 'INPUT0'"),
        "{err}"
    );
}

#[test]
fn request_level_convention_fills_shape_from_config() {
    let config = with_convention(
        add_sub_config("m", 0, &[4]),
        BatchConvention::RequestLevel,
    );
    let backend = handle(config);

    let mut request = InferenceRequest::new("m");
    request.add_original_input(Input::new("INPUT0", &[])).unwrap();
    request.add_original_input(Input::new("INPUT1", &[])).unwrap();
    request.set_batch_size(1);
    request.prepare(&backend).unwrap();

    for input in request.inputs() {
        assert_eq!(input.shape(), &[4]);
        assert_eq!(input.batch_byte_size(), 16);
    }
}

#[test]
fn request_level_convention_rejects_omitted_variable_shape() {
    let config = with_convention(
        add_sub_config("m", 0, &[WILDCARD_DIM]),
        BatchConvention::RequestLevel,
    );
    let backend = handle(config);

    let mut request = InferenceRequest::new("m");
    request.add_original_input(Input::new("INPUT0", &[])).unwrap();
    request.add_original_input(Input::new("INPUT1", &[])).unwrap();
    request.set_batch_size(1);
    let err = request.prepare(&backend).unwrap_err();
    assert!(
        err.to_string()
            .contains("model supports variable-size for input 'INPUT0'"),
        "{err}"
    );
}

#[test]
fn prepare_is_idempotent() {
    let backend = handle(add_sub_config("m", 8, &[4]));
    let mut request = add_sub_request(&[2, 4], 8);

    request.prepare(&backend).unwrap();
    let batch = request.batch_size();
    let shapes: Vec<Vec<i64>> = request.inputs().map(|i| i.shape().to_vec()).collect();
    let sizes: Vec<u64> = request.inputs().map(|i| i.batch_byte_size()).collect();

    request.prepare(&backend).unwrap();
    assert_eq!(request.batch_size(), batch);
    assert_eq!(
        request.inputs().map(|i| i.shape().to_vec()).collect::<Vec<_>>(),
        shapes
    );
    assert_eq!(
        request
            .inputs()
            .map(|i| i.batch_byte_size())
            .collect::<Vec<_>>(),
        sizes
    );
}

#[test]
fn priority_clamps_to_default_level() {
    let config = with_batching(
        add_sub_config("m", 8, &[4]),
        DynamicBatching {
            priority_levels: 2,
            default_priority_level: 1,
            ..Default::default()
        },
    );
    let backend = handle(config);

    let mut unset = add_sub_request(&[1, 4], 4);
    unset.prepare(&backend).unwrap();
    assert_eq!(unset.priority(), 1);

    let mut over = add_sub_request(&[1, 4], 4);
    over.set_priority(9);
    over.prepare(&backend).unwrap();
    assert_eq!(over.priority(), 1);

    let mut in_range = add_sub_request(&[1, 4], 4);
    in_range.set_priority(2);
    in_range.prepare(&backend).unwrap();
    assert_eq!(in_range.priority(), 2);
}

#[test]
fn overrides_survive_until_the_next_prepare() {
    let backend = handle(add_sub_config("m", 0, &[4]));
    let mut request = add_sub_request(&[4], 4);
    request.prepare(&backend).unwrap();

    // An override installed after prepare shadows the original in the
    // frozen view.
    request.add_override_input(
        int32_input("INPUT0", &[4], &[9, 9, 9, 9]),
    );
    let seen = request.input("INPUT0").unwrap();
    assert_eq!(seen.data().unwrap().gather(), pack_i32(&[9, 9, 9, 9]));

    // The next prepare clears stale overrides and the original shows
    // through again.
    request.prepare(&backend).unwrap();
    let seen = request.input("INPUT0").unwrap();
    assert_eq!(seen.data().unwrap().gather(), pack_i32(&[0, 1, 2, 3]));
}

#[test]
fn remove_then_override_without_prepare_is_permitted() {
    let backend = handle(add_sub_config("m", 0, &[4]));
    let mut request = add_sub_request(&[4], 4);

    request.remove_original_input("INPUT0").unwrap();
    request.add_override_input(int32_input("INPUT0", &[4], &[7, 7, 7, 7]));

    // The override is visible immediately...
    assert!(request.input("INPUT0").is_ok());

    // ...but prepare rebuilds from originals only, so the model now sees
    // too few inputs.
    let err = request.prepare(&backend).unwrap_err();
    assert!(err.to_string().contains("expected 2 inputs"), "{err}");
}
