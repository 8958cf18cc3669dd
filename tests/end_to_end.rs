//! Black-box end-to-end scenarios, driven entirely through the public API.

use netvm::prelude::*;

fn header(max_stack_size: u32, locals_size: u32) -> SegmentHeader {
    SegmentHeader { max_stack_size, locals_size }
}

#[test]
fn minimal_push_segment_runs_with_no_side_effects() {
    // [pop; ret], max_stack=1, locals=0
    let code = [0x01u8, 0x06];
    let compiled = compile_segment(&code, header(1, 0), SegmentKind::Push, &CompileOptions::default())
        .expect("minimal segment compiles");
    assert!(compiled.code_len > 0);

    let mut vm = NetVm::new(1);
    let pe = vm.create_pe(CoprocessorTable::new());
    let mut exbuf = vm.get_exchange_buffer().unwrap();
    vm.push(pe, &mut exbuf).expect("push on a PE with no installed handler is a no-op, not an error");
    // Running against a PE with no installed push handler is a no-op; the scenario's
    // "no side effects" property holds trivially since nothing was installed to mutate
    // `exbuf`.
    assert!(exbuf.packet.is_empty());
}

#[test]
fn installed_push_handler_actually_executes_and_mutates_data_memory() {
    use netvm::container::{CodeSection, FileHeader, Image, SectionEntry, SectionFlags};

    // pushbyte 3 (index); pushbyte 200 (value); dbstore; ret
    let code = vec![0x05u8, 3, 0x05, 200, 0x63, 0x06];
    let image = Image {
        header: FileHeader::default(),
        code_sections: vec![(
            SectionEntry { name: "push".into(), size: 0, file_offset: 0, flags: SectionFlags::CODE | SectionFlags::PUSH },
            CodeSection { header: header(2, 0), code },
        )],
        port_sections: Vec::new(),
        line_map_sections: Vec::new(),
    };

    let mut vm = NetVm::new(1);
    let pe = vm.create_pe(CoprocessorTable::new());
    vm.load_pe_image(pe, &image, &CompileOptions::default()).expect("image compiles and installs");

    let mut exbuf = vm.get_exchange_buffer().unwrap();
    vm.push(pe, &mut exbuf).expect("compiled handler runs to completion");
    vm.release_exchange_buffer(exbuf);

    assert_eq!(
        vm.handler_stats(pe, SegmentSlot::Push).unwrap().unwrap().invocations,
        1,
        "handler must actually have been invoked, not just bookkept"
    );
    assert_eq!(
        vm.pe_data_memory_mut(pe).unwrap()[3],
        200,
        "the compiled dbstore must have actually executed, not merely been bookkept"
    );
}

#[test]
fn stack_underflow_is_reported_at_the_second_pop() {
    // [pop; pop; ret], max_stack=1
    let code = [0x01u8, 0x01, 0x06];
    let err = compile_segment(&code, header(1, 0), SegmentKind::Push, &CompileOptions::default()).unwrap_err();
    match err {
        NetVmError::Verify(errors) => {
            assert!(errors.iter().any(|e| matches!(e, VerifyError::StackUnderflow { index: 1, .. })));
        }
        other => panic!("expected a verification failure, got {other:?}"),
    }
}

#[test]
fn branch_to_mid_instruction_is_rejected() {
    // push 1; jumpw 1; ret -- the jumpw target lands inside push's operand bytes
    let mut code = vec![0x04u8];
    code.extend_from_slice(&1i32.to_le_bytes());
    code.push(0x21);
    code.extend_from_slice(&1i32.to_le_bytes());
    code.push(0x06);

    let err = compile_segment(&code, header(1, 0), SegmentKind::Push, &CompileOptions::default()).unwrap_err();
    match err {
        NetVmError::Verify(errors) => {
            assert!(errors.iter().any(|e| matches!(e, VerifyError::InvalidBranchTarget { .. })));
        }
        other => panic!("expected a verification failure, got {other:?}"),
    }
}

#[test]
fn lookup_coprocessor_round_trips_a_key() {
    use netvm::coprocessors::lookup_new::LookupNewCoprocessor;

    let mut copro = LookupNewCoprocessor::new();
    copro.init(&[]).unwrap();

    for (i, word) in [1u32, 2, 3, 4, 5].into_iter().enumerate() {
        copro.write(i, word as u64).unwrap();
    }
    copro.write(5, 0xAA).unwrap();
    copro.write(6, 0xBB).unwrap();
    let exbuf = ExchangeBuffer::default();
    copro.invoke(1, &exbuf).unwrap(); // INSERT

    for (i, word) in [1u32, 2, 3, 4, 5].into_iter().enumerate() {
        copro.write(i, word as u64).unwrap();
    }
    copro.invoke(2, &exbuf).unwrap(); // LOOKUP
    assert_eq!(copro.read(7).unwrap(), 1); // match
    assert_eq!(copro.read(5).unwrap(), 0xAA);
    assert_eq!(copro.read(6).unwrap(), 0xBB);

    for (i, word) in [1u32, 2, 3, 4, 6].into_iter().enumerate() {
        copro.write(i, word as u64).unwrap();
    }
    copro.invoke(2, &exbuf).unwrap();
    assert_eq!(copro.read(7).unwrap(), 0); // no match
}

#[test]
fn string_match_coprocessor_finds_both_patterns_in_order() {
    use netvm::coprocessors::stringmatching::StringMatchCoprocessor;

    let mut blob = Vec::new();
    blob.extend_from_slice(&1u16.to_le_bytes()); // 1 group
    blob.extend_from_slice(&2u16.to_le_bytes()); // 2 patterns
    for (pattern, user_data) in [("foo", 1u32), ("bar", 2)] {
        blob.extend_from_slice(&(pattern.len() as u16).to_le_bytes());
        blob.extend_from_slice(&0u16.to_le_bytes()); // case-sensitive
        blob.extend_from_slice(&user_data.to_le_bytes());
        blob.extend_from_slice(pattern.as_bytes());
    }

    let mut copro = StringMatchCoprocessor::new();
    copro.init(&blob).unwrap();

    let mut exbuf = ExchangeBuffer::default();
    exbuf.packet = b"prefoostuffbarend".to_vec();
    copro.write(0, 0).unwrap(); // group id
    copro.write(2, exbuf.packet.len() as u64).unwrap(); // haystack length
    copro.invoke(1, &exbuf).unwrap(); // TRYMATCH
    assert_eq!(copro.read(0).unwrap(), 2);

    copro.invoke(3, &exbuf).unwrap(); // GETRESULT
    assert_eq!(copro.read(2).unwrap(), 6);
    copro.invoke(3, &exbuf).unwrap();
    assert_eq!(copro.read(2).unwrap(), 14);
}

#[test]
fn switch_dispatch_compiles_and_every_case_reaches_its_own_block() {
    // switch on 7 with cases {3->A, 7->B, 12->C}, default D; each target is a bare ret.
    let mut code = vec![0x04u8];
    code.extend_from_slice(&7i32.to_le_bytes());
    let switch_offset = code.len();
    code.push(0x26);
    let placeholder = code.len();
    code.extend_from_slice(&[0u8; 8]);
    let cases = [(3i32, 0usize), (7, 0), (12, 0)];
    for _ in &cases {
        code.extend_from_slice(&[0u8; 8]);
    }

    let mut targets = Vec::new();
    for _ in 0..4 {
        targets.push(code.len());
        code.push(0x06);
    }

    let default_rel = (targets[3] as i64 - switch_offset as i64) as i32;
    code[placeholder..placeholder + 4].copy_from_slice(&default_rel.to_le_bytes());
    code[placeholder + 4..placeholder + 8].copy_from_slice(&(cases.len() as u32).to_le_bytes());
    for (i, (value, target_idx)) in [(3i32, 0usize), (7, 1), (12, 2)].into_iter().enumerate() {
        let entry_offset = placeholder + 8 + i * 8;
        code[entry_offset..entry_offset + 4].copy_from_slice(&value.to_le_bytes());
        let rel = (targets[target_idx] as i64 - switch_offset as i64) as i32;
        code[entry_offset + 4..entry_offset + 8].copy_from_slice(&rel.to_le_bytes());
    }

    let compiled = compile_segment(&code, header(1, 0), SegmentKind::Push, &CompileOptions::default())
        .expect("switch segment compiles");
    // Every case and the default resolved to a distinct block address.
    let mut addresses: Vec<usize> = compiled.block_addresses.values().copied().collect();
    addresses.sort_unstable();
    addresses.dedup();
    assert_eq!(addresses.len(), compiled.block_addresses.len());
}
