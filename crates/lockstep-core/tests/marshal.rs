mod fake;

use fake::{regs, FakeController};
use lockstep_core::marshal::{BufferSource, CustomMarshal, EchoWidth};
use lockstep_core::{MarshalRegistry, MarshalStrategy, RegisterState};

const ESP: u32 = 0x0019_fe00;

fn after(eax: u32) -> RegisterState {
    RegisterState {
        eax,
        ..regs(0x0040_1234, ESP)
    }
}

#[test]
fn fixed_width_echo_truncates_to_width() {
    let mut reference = FakeController::new(regs(0, ESP));
    let u16_echo = MarshalStrategy::FixedWidthEcho {
        width: EchoWidth::U16,
    };
    let u32_echo = MarshalStrategy::FixedWidthEcho {
        width: EchoWidth::U32,
    };
    assert_eq!(
        u16_echo.encode(&after(0x0001_0203), &mut reference).unwrap(),
        vec![vec![0x03, 0x02]]
    );
    assert_eq!(
        u32_echo.encode(&after(0x0001_0203), &mut reference).unwrap(),
        vec![vec![0x03, 0x02, 0x01, 0x00]]
    );
}

#[test]
fn returned_pointer_buffer_sends_pointer_length_and_text() {
    let mut reference = FakeController::new(regs(0, ESP)).with_bytes(0x0050_0000, b"app.exe -v\0");
    let strategy = MarshalStrategy::LengthPrefixedBuffer {
        source: BufferSource::ReturnedPointer,
    };
    let out = strategy.encode(&after(0x0050_0000), &mut reference).unwrap();
    assert_eq!(
        out,
        vec![
            0x0050_0000u32.to_le_bytes().to_vec(),
            11u32.to_le_bytes().to_vec(),
            b"app.exe -v\0".to_vec(),
        ]
    );
}

#[test]
fn stack_buffer_reads_relative_to_esp() {
    let mut reference = FakeController::new(regs(0, ESP)).with_bytes(ESP + 8, b"C:\\work\0");
    let strategy = MarshalStrategy::LengthPrefixedBuffer {
        source: BufferSource::Stack { offset: 8 },
    };
    let out = strategy.encode(&after(7), &mut reference).unwrap();
    assert_eq!(out, vec![8u32.to_le_bytes().to_vec(), b"C:\\work\0".to_vec()]);
}

#[test]
fn environment_block_is_rejoined_with_double_terminator() {
    let mut reference =
        FakeController::new(regs(0, ESP)).with_bytes(0x0060_0000, b"A=1\0PATH=x\0\0");
    let strategy = MarshalStrategy::Custom {
        handler: CustomMarshal::EnvironmentBlock,
    };
    let out = strategy.encode(&after(0x0060_0000), &mut reference).unwrap();
    let block = b"A=1\0PATH=x\0\0".to_vec();
    assert_eq!(out.len(), 3);
    assert_eq!(out[1], (block.len() as u32).to_le_bytes().to_vec());
    assert_eq!(out[2], block);
}

#[test]
fn unreadable_buffer_is_reported() {
    let mut reference = FakeController::new(regs(0, ESP));
    let strategy = MarshalStrategy::LengthPrefixedBuffer {
        source: BufferSource::ReturnedPointer,
    };
    let err = strategy.encode(&after(0x0070_0000), &mut reference).unwrap_err();
    assert_eq!(err.kind(), "unmapped_memory");
}

#[test]
fn registry_parses_from_config_json_and_defaults_to_noop() {
    let registry: MarshalRegistry = serde_json::from_str(
        r#"{
            "KERNEL32!GetTickCount": {"kind": "fixed_width_echo", "width": "u32"},
            "KERNEL32!GetCommandLineA": {"kind": "length_prefixed_buffer", "source": {"from": "returned_pointer"}},
            "KERNEL32!GetCurrentDirectoryA": {"kind": "length_prefixed_buffer", "source": {"from": "stack", "offset": 8}},
            "KERNEL32!GetEnvironmentStrings": {"kind": "custom", "handler": "environment_block"}
        }"#,
    )
    .unwrap();
    assert_eq!(registry.len(), 4);
    assert!(registry.needs_push());
    assert_eq!(
        registry.lookup("KERNEL32!GetCurrentDirectoryA"),
        MarshalStrategy::LengthPrefixedBuffer {
            source: BufferSource::Stack { offset: 8 }
        }
    );
    assert_eq!(registry.lookup("KERNEL32!ExitProcess"), MarshalStrategy::NoOp);
    assert!(!MarshalRegistry::default().needs_push());
}
