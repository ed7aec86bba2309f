//! Walks the FUOTA phase table end to end (§4.6): silence sub-steps, leaf
//! detection, a multi-page image transfer with one mid-stream mismatch, and
//! the unsilence chain back to rollback.

use hes_core::fuota::{
    crc16, detect_leaves, max_payload_size, FuotaPhase, ImageTransferAction, ImageTransferEvent,
    ImageTransferState, SilenceStep,
};
use hes_core::path_book::PathInfo;

fn mac(n: u8) -> [u8; 8] {
    [0, 0, 0, 0, 0, 0, 0, n]
}

#[test]
fn phase_table_walks_open_file_through_rollback() {
    let mut phase = FuotaPhase::OpenFile;
    let order = [
        FuotaPhase::GatewayPathSilence,
        FuotaPhase::TargetNodeSilence,
        FuotaPhase::NetworkSilence,
        FuotaPhase::SectorRead,
        FuotaPhase::FirmwareSectorCount,
        FuotaPhase::EraseFlash,
        FuotaPhase::ImageTransfer,
        FuotaPhase::EndOfPage,
        FuotaPhase::CrcCompute,
        FuotaPhase::Activate,
        FuotaPhase::ReadCompareFirmwareVersion,
        FuotaPhase::NetworkUnsilence,
        FuotaPhase::TargetNodeUnsilence,
        FuotaPhase::GatewayPathUnsilence,
        FuotaPhase::RollbackToNormal,
    ];
    for expected in order {
        phase = phase.next_on_success();
        assert_eq!(phase, expected);
    }
    // terminal phase is a fixed point.
    assert_eq!(phase.next_on_success(), FuotaPhase::RollbackToNormal);
}

#[test]
fn retry_exhaustion_mid_silence_falls_through_to_network_unsilence() {
    assert_eq!(FuotaPhase::TargetNodeSilence.on_retries_exhausted(), FuotaPhase::NetworkUnsilence);
    assert_eq!(FuotaPhase::ImageTransfer.on_retries_exhausted(), FuotaPhase::NetworkUnsilence);
    assert_eq!(FuotaPhase::TargetNodeUnsilence.on_retries_exhausted(), FuotaPhase::RollbackToNormal);
}

#[test]
fn silence_sub_steps_run_in_fixed_order() {
    let mut step = SilenceStep::FuotaEnable;
    let mut seen = vec![step];
    while let Some(next) = step.next() {
        seen.push(next);
        step = next;
    }
    assert_eq!(
        seen,
        vec![
            SilenceStep::FuotaEnable,
            SilenceStep::FuotaModeEntry,
            SilenceStep::FlashSave,
            SilenceStep::FlashExit,
        ]
    );
}

#[test]
fn full_image_transfer_with_one_subpage_mismatch_then_completes() {
    let target = mac(9);
    let routes = vec![
        (mac(1), PathInfo { hop_count: 0, hop_addresses: vec![9, 9, 9, 1] }),
        (target, PathInfo { hop_count: 1, hop_addresses: vec![9, 9, 9, 1, 9, 9, 9, 9] }),
    ];
    let leaves = detect_leaves(&routes, target);
    assert!(leaves.is_empty(), "mac(1) is used as an intermediate hop, not a leaf");

    let sector_size = 4096u16;
    let max_payload = max_payload_size(1);
    let page_count = 2;
    let subpage_count = hes_core::fuota::compute_subpage_count(sector_size, max_payload);

    let mut state = ImageTransferState::new(page_count, subpage_count, sector_size, max_payload);
    assert_eq!(
        state.on_event(ImageTransferEvent::Ack { last_subpage_of_page: false }),
        ImageTransferAction::SendSubpage { page: 0, subpage: 1 }
    );

    // target reports it only got through subpage 0 of page 0 — rewind.
    let resumed = state.on_event(ImageTransferEvent::SubpageMismatch { page: 0, subpage: 0 });
    assert_eq!(
        resumed,
        ImageTransferAction::SeekAndResume { file_offset: 0, resume_page: 0, resume_subpage: 1 }
    );

    // drain the remaining subpages of page 0, then page 1, to completion.
    let mut action = ImageTransferAction::SendSubpage { page: 0, subpage: 1 };
    let mut guard = 0;
    loop {
        guard += 1;
        assert!(guard < 1000, "image transfer did not converge");
        match action {
            ImageTransferAction::Done => break,
            ImageTransferAction::SendSubpage { page, subpage } => {
                let last = subpage + 1 >= subpage_count;
                action = state.on_event(ImageTransferEvent::Ack { last_subpage_of_page: last });
                let _ = page;
            }
            other => panic!("unexpected action mid-transfer: {other:?}"),
        }
    }
    assert_eq!(crc16(b"same input"), crc16(b"same input"));
}
