mod common;

use common::*;
use vira_ir::{AddressSpace, Buffer, DataType, Function, Scalar};
use vira_target::{TargetDescriptor, TargetError, TargetRegistry};

const WIDE: &str = r#"{
    "name": "wide",
    "native_vector_bits": 512,
    "address_spaces": [
        { "space": "Global", "name": "ddr", "dma_capable": true, "compute_accessible": false },
        { "space": "Shared", "name": "gsram", "dma_capable": true, "compute_accessible": true,
          "capacity_bytes": 1048576 }
    ],
    "instructions": ["strided-load", "reverse-sub"],
    "dma_queues": 2,
    "max_events_per_queue": 2
}"#;

#[test]
fn descriptor_from_json_drives_vector_width() {
    let wide = TargetDescriptor::from_json(WIDE).unwrap();
    assert_eq!(wide.native_lanes(Scalar::F32), 16);

    let shape = [2, 3, 40];
    let before = add3d(&shape);
    let after = lower(before.clone(), &wide);
    let lanes: Vec<u16> = expressions(&after).iter().map(|e| e.lanes()).collect();
    assert!(lanes.iter().all(|&n| n <= 16));
    assert!(lanes.contains(&16));

    let inputs = [
        ("a", floats((0..240).map(|i| i as f32))),
        ("b", floats((0..240).map(|i| (i % 7) as f32))),
    ];
    assert_eq!(eval(&before, &inputs, &["c"]), eval(&after, &inputs, &["c"]));
}

#[test]
fn inconsistent_descriptor_is_rejected() {
    let broken = WIDE.replace("\"dma_queues\": 2", "\"dma_queues\": 0");
    let err = TargetDescriptor::from_json(&broken).unwrap_err();
    assert!(matches!(err, TargetError::Invalid { .. }), "{err}");
    assert!(err.to_string().contains("DMA queue"));
}

#[test]
fn registered_target_resolves_by_name() {
    let mut registry = TargetRegistry::with_builtins();
    assert!(registry.resolve("wide").is_err());
    registry.register(TargetDescriptor::from_json(WIDE).unwrap());
    assert_eq!(registry.resolve("wide").unwrap().native_vector_bits, 512);
}

#[test]
fn transfers_beyond_the_event_budget_are_throttled() {
    // v1 has one queue of four events; twelve transfers must share them.
    let v1 = target("v1");
    let f32 = DataType::F32;
    let mut func = Function::new("fanout");
    let mut stmts = Vec::new();
    let mut outs = Vec::new();
    for k in 0..6 {
        let global = |name: String| Buffer::fixed(name, f32, &[16], AddressSpace::Global);
        let g = func.add_buffer_param(global(format!("g{k}")));
        let o = func.add_buffer_param(global(format!("o{k}")));
        let s = func.add_scratch(Buffer::fixed(format!("s{k}"), f32, &[16], AddressSpace::Shared));
        stmts.push(copy(&[16], s, g, f32));
        outs.push(copy(&[16], o, s, f32));
    }
    stmts.extend(outs);
    func.body = vira_ir::Stmt::seq(stmts);

    let after = lower(func, &v1);
    assert_eq!(dmas(&after).len(), 12);
    let state = after.event_state.as_ref().unwrap();
    assert!(state.max_in_flight <= v1.max_events_per_queue);
    for slot in &state.slots {
        assert_eq!(slot.queue, 0);
        assert!(slot.slot < v1.max_events_per_queue);
    }

    let inputs: Vec<(String, _)> = (0..6)
        .map(|k| (format!("g{k}"), floats((0..16).map(|i| (i * 10 + k) as f32))))
        .collect();
    let inputs: Vec<(&str, _)> = inputs.iter().map(|(n, v)| (n.as_str(), v.clone())).collect();
    let names: Vec<String> = (0..6).map(|k| format!("o{k}")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let out = eval(&after, &inputs, &names);
    for (k, data) in out.iter().enumerate() {
        assert_eq!(data, &inputs[k].1);
    }
}
