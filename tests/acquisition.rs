use cnea_daq::{
    processing::{frame_from_words, words_from_bytes},
    AcquisitionService, BlockNotice, Conf, DaqError, DeviceContext, NotificationSink,
};
use crossbeam_channel::bounded;
use std::{sync::Arc, time::Duration};

const BLOCK_WORDS: usize = 4096;

fn service(seed: u64) -> AcquisitionService {
    let mut settings = Conf::defaults().unwrap().acquisition;
    settings.buffer_size_mb = 1;
    settings.data_length_words = BLOCK_WORDS;
    settings.read_interval_ms = 1;
    let mut acq = AcquisitionService::new(DeviceContext::simulated(seed), &settings);
    assert!(acq.initialize());
    acq
}

#[test]
fn runs_fixed_number_of_iterations() {
    let mut acq = service(7);
    acq.set_iteration_limit(Some(12));

    let id = acq.start(0xFFFF_FFFF, 10_000.0).unwrap();
    assert!(acq.wait_for_reader(Duration::from_secs(10)));

    let status = acq.status();
    assert!(status.is_recording);
    assert_eq!(status.session_id, Some(id));
    assert_eq!(status.iteration_count, 12);
    assert!((0.0..=100.0).contains(&status.buffer_fill_pct));
    assert_eq!(status.buffer_stats.total_written, 12 * BLOCK_WORDS as u64 * 2);
    assert!(status.device_info.simulated);

    let summary = acq.stop().unwrap();
    assert_eq!(summary.session_id, id);
    assert_eq!(summary.iteration_count, 12);
    assert_eq!(summary.packets_dropped, 0);
    assert!(summary.elapsed_s > 0.0);

    let status = acq.status();
    assert!(!status.is_recording);
    assert_eq!(status.session_id, None);
}

#[test]
fn second_start_conflicts() {
    let mut acq = service(1);
    acq.set_iteration_limit(Some(1));
    acq.start(0xFFFF_FFFF, 10_000.0).unwrap();
    assert!(matches!(
        acq.start(0xFFFF_FFFF, 10_000.0),
        Err(DaqError::Conflict(_))
    ));
    acq.stop().unwrap();
    assert!(matches!(acq.stop(), Err(DaqError::Conflict(_))));

    // A fresh session after the first one is fine.
    acq.start(0x1, 10_000.0).unwrap();
    acq.stop().unwrap();
}

#[test]
fn notifications_follow_blocks() {
    let mut acq = service(3);
    let (tx, rx) = bounded::<BlockNotice>(64);
    let sink: Arc<dyn NotificationSink> = Arc::new(tx);
    acq.set_notification_sink(Some(sink));
    acq.set_iteration_limit(Some(4));

    acq.start(0xFFFF_FFFF, 10_000.0).unwrap();
    assert!(acq.wait_for_reader(Duration::from_secs(10)));
    acq.stop().unwrap();

    let notices: Vec<BlockNotice> = rx.try_iter().collect();
    assert_eq!(notices.len(), 4);
    for (i, n) in notices.iter().enumerate() {
        assert_eq!(n.sequence, i as u64);
        assert_eq!(n.size, BLOCK_WORDS * 2);
    }
}

#[test]
fn buffered_data_decodes_to_adc_codes() {
    let mut acq = service(11);
    acq.set_iteration_limit(Some(2));
    acq.start(0xFFFF_FFFF, 10_000.0).unwrap();
    assert!(acq.wait_for_reader(Duration::from_secs(10)));
    acq.stop().unwrap();

    let buffer = acq.ring_buffer();
    let bytes = buffer.read(BLOCK_WORDS * 2).unwrap();
    let words = words_from_bytes(&bytes);
    assert_eq!(words.len(), BLOCK_WORDS);
    assert!(words.iter().all(|&w| w <= 4095));

    let frame = frame_from_words(&words, BLOCK_WORDS);
    assert_eq!(frame.dim(), (BLOCK_WORDS, 1));
    let mean = frame.mean().unwrap();
    assert!((mean - 2360.0).abs() < 10.0, "mean {}", mean);
}
