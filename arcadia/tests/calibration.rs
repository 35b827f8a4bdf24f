use arcadia::{
    chip::calibration::UNLOCKED_ERRORS,
    core::TAP_VALUES,
    prelude::*,
    transport::mock::Access,
};
use std::time::Duration;

const FAST: CalibrationConfig = CalibrationConfig {
    settle: Duration::ZERO,
};

fn clean_window(taps: impl IntoIterator<Item = usize>) -> [u16; TAP_VALUES] {
    let mut errors = [50; TAP_VALUES];
    for tap in taps {
        errors[tap] = 0;
    }
    errors
}

#[test]
fn calibrate_mixed_lanes() {
    let mut mock = Mock::new();
    mock.set_lane_errors(1, 0, clean_window(10..=20));
    mock.set_lane_errors(1, 1, clean_window((28..32).chain(0..5)));
    mock.set_lane_errors(1, 2, [UNLOCKED_ERRORS; TAP_VALUES]);
    mock.set_lane_errors(1, 3, [5; TAP_VALUES]);
    let mut fpga = Fpga::new(mock, false).unwrap();
    let chip = fpga.chip_mut(1).unwrap();
    chip.send_controller_command("setIDELAYTap2", 7).unwrap();
    chip.send_controller_command("setIDELAYTap3", 9).unwrap();

    let report = chip.calibrate_deserializers(&FAST).unwrap();

    // Lanes 8 to 11 select the same counters as lanes 0 to 3
    for offset in [0, 8] {
        assert_eq!(report.taps[offset], Some(15));
        assert_eq!(report.taps[offset + 1], Some(0));
        assert_eq!(report.taps[offset + 2], None);
        assert_eq!(report.taps[offset + 3], None);
        assert!(report.taps[offset + 4..offset + 8]
            .iter()
            .all(|&tap| tap == Some(16)));
    }
    assert_eq!(report.locked, 0xf3f3);

    assert_eq!(report.errors[0][5], 50);
    assert_eq!(report.errors[0][12], 0);
    assert!(report.errors[2].iter().all(|&e| e == UNLOCKED_ERRORS));
    assert!(report.errors[3].iter().all(|&e| e == 5));
    assert_eq!(report.errors[8], report.errors[0]);

    // Unresolved lanes are put back where they were
    assert_eq!(chip.tap(2), 7);
    assert_eq!(chip.tap(3), 9);
    assert_eq!(chip.tap(10), 0);
    let taps = fpga.transport.lock().unwrap().taps(1);
    assert_eq!(&taps[..4], &[15, 0, 7, 9]);
    assert_eq!(&taps[8..12], &[15, 0, 0, 0]);
    assert!(taps[4..8].iter().chain(&taps[12..]).all(|&tap| tap == 16));
}

#[test]
fn error_counters_selected_by_twice_the_lane() {
    let mut fpga = Fpga::new(Mock::new(), false).unwrap();
    fpga.chip_mut(0).unwrap().calibrate_deserializers(&FAST).unwrap();
    let transport = fpga.transport.lock().unwrap();
    let selects: Vec<u32> = transport
        .accesses()
        .iter()
        .filter_map(|access| match access {
            Access::Write(node, value) if node == "controller_id0" && *value >> 20 == 0x13 => {
                Some(*value & 0xfffff)
            }
            _ => None,
        })
        .collect();
    // Every lane is locked on every tap of the sweep, plus the final check
    let per_pass: Vec<u32> = (0..16).map(|lane| (lane * 2) & 0xf).collect();
    assert_eq!(selects.len(), (TAP_VALUES + 1) * 16);
    for pass in selects.chunks(16) {
        assert_eq!(pass, per_pass.as_slice());
    }
}

#[test]
fn calibration_only_touches_its_chip() {
    let mut fpga = Fpga::new(Mock::new(), false).unwrap();
    let report = fpga.chip_mut(0).unwrap().calibrate_deserializers(&FAST).unwrap();
    assert_eq!(report.locked, 0xffff);
    let transport = fpga.transport.lock().unwrap();
    assert_eq!(transport.taps(0), [16; 16]);
    assert_eq!(transport.taps(2), [0; 16]);
}

#[test]
fn calibration_fails_on_dead_link() {
    let mut mock = Mock::new();
    mock.fail_nodes("controller_id2");
    let mut fpga = Fpga::new(mock, false).unwrap();
    assert!(matches!(
        fpga.chip_mut(2).unwrap().calibrate_deserializers(&FAST),
        Err(Error::Transport(_))
    ));
}
