//! Integration tests for the transaction controller.
//!
//! These tests verify that:
//! - A submitted frame completes through the poll callback
//! - Every submission failure leaves requests, sources and destinations reusable
//! - Destination buffers survive their controller
//! - Streaming and format negotiation behave as documented

use mediabufs::bufs::{MediaBufsCtl, QentDst, QentStatus};
use mediabufs::config::MediaConfig;
use mediabufs::error::Error;
use mediabufs::media::MediaPool;
use mediabufs::memory::MemfdAllocator;
use mediabufs::poll::PollFlags;
use mediabufs::testing::{
    LimitedAllocator, MOCK_CTRL_DECODE_MODE, MOCK_CTRL_SPS, ManualPollQueue, MockMediaDevice,
    MockVideoDevice,
};
use mediabufs::v4l2::sys::{V4L2_BUF_FLAG_M2M_HOLD_CAPTURE_BUF, V4L2_EVENT_SOURCE_CHANGE};
use mediabufs::v4l2::{BufType, CtrlValue, ExtControl, FourCc};
use std::time::Duration;

const OUT: BufType = BufType::VideoOutputMplane;
const CAP: BufType = BufType::VideoCaptureMplane;

struct Rig {
    video: MockVideoDevice,
    media: MockMediaDevice,
    poll: ManualPollQueue,
    ctl: MediaBufsCtl,
    pool: MediaPool,
    alloc: MemfdAllocator,
}

impl Rig {
    fn new() -> Self {
        Self::with_video(MockVideoDevice::new(), true)
    }

    fn with_video(video: MockVideoDevice, stream_on: bool) -> Self {
        let poll = ManualPollQueue::new();
        let shared = poll.shared();
        let ctl = MediaBufsCtl::with_device(Box::new(video.clone()), &shared, &MediaConfig::default())
            .unwrap();
        ctl.src_fmt_set(ctl.src_type(), FourCc::new(b"S264"), 1920, 1080, 0)
            .unwrap();
        ctl.dst_fmt_set(1920, 1080, |_| true).unwrap();

        let alloc = MemfdAllocator::new();
        ctl.src_pool_create(&alloc, 4).unwrap();
        if stream_on {
            ctl.stream_on().unwrap();
        }

        let media = MockMediaDevice::new();
        let pool = MediaPool::with_device(Box::new(media.clone()), &shared, 4, Duration::from_secs(2))
            .unwrap();

        Self {
            video,
            media,
            poll,
            ctl,
            pool,
            alloc,
        }
    }

    /// Submit one frame into a fresh destination buffer.
    fn submit(&self, payload: &[u8], timestamp: Duration) -> mediabufs::Result<QentDst> {
        let dst = self.ctl.dst_qent_alloc(&self.alloc)?;
        self.submit_into(&dst, payload, timestamp, true)?;
        Ok(dst)
    }

    fn submit_into(&self, dst: &QentDst, payload: &[u8], timestamp: Duration, is_final: bool) -> mediabufs::Result<()> {
        let req = self.pool.acquire();
        let mut src = self.ctl.src_qent_get();
        src.copy_in(0, payload, &self.alloc)?;
        src.params_set(timestamp);
        self.ctl.set_ext_ctrl(Some(&req), MOCK_CTRL_SPS, &[0u8; 16])?;
        self.ctl.start_request(req, src, Some(dst), is_final)
    }

    /// Let the driver finish one frame and deliver the readiness.
    fn finish_frame(&self, error: bool) {
        self.video.complete_frame(error);
        assert!(self.poll.fire(self.video.poll_raw_fd(), PollFlags::IN | PollFlags::OUT));
    }
}

#[test]
fn test_full_decode_flow() {
    let rig = Rig::new();
    let ts = Duration::from_millis(40);
    let dst = rig.submit(&[0xAB; 1000], ts).unwrap();

    assert!(rig.ctl.is_polling());
    assert!(dst.is_waiting());
    assert_eq!(dst.status(), QentStatus::Waiting);
    assert_eq!(rig.media.queued_count(), 1);
    assert_eq!(rig.ctl.src_free_count(), 3);

    let src_buf = rig.video.last_queued(OUT).unwrap();
    assert!(src_buf.request_fd.is_some());
    assert_eq!(src_buf.flags & V4L2_BUF_FLAG_M2M_HOLD_CAPTURE_BUF, 0);
    assert_eq!(src_buf.timestamp, ts);
    assert_eq!(src_buf.planes[0].bytesused, 1000);

    let dst_buf = rig.video.last_queued(CAP).unwrap();
    assert_eq!(dst_buf.timestamp, Duration::ZERO);
    assert_eq!(dst_buf.planes[0].bytesused, 0);

    let controls = rig.video.request_controls();
    assert_eq!(controls.len(), 1);
    assert_eq!(Some(controls[0].0), src_buf.request_fd);

    rig.finish_frame(false);

    dst.wait().unwrap();
    assert_eq!(dst.status(), QentStatus::Done);
    assert_eq!(dst.timestamp(), ts);
    assert_eq!(dst.plane_len(0), dst.plane_size(0));
    assert_eq!(rig.ctl.src_free_count(), 4);
    assert!(!rig.ctl.is_polling());
}

#[test]
fn test_request_reclaimed_on_completion() {
    let rig = Rig::new();
    let _dst = rig.submit(&[1; 64], Duration::ZERO).unwrap();
    assert_eq!(rig.pool.stats().in_flight, 1);

    let req_fd = rig.media.queued_fds()[0];
    assert!(rig.poll.fire(req_fd, PollFlags::PRI));
    assert_eq!(rig.pool.stats().available, 4);
    assert_eq!(rig.media.reinit_count(), 1);
}

#[test]
fn test_wait_blocks_until_completion() {
    let rig = Rig::new();
    let dst = rig.submit(&[2; 64], Duration::from_millis(1)).unwrap();

    std::thread::scope(|s| {
        let waiter = s.spawn(|| dst.wait());
        std::thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());
        rig.finish_frame(false);
        assert!(waiter.join().unwrap().is_ok());
    });
}

#[test]
fn test_hold_flag_on_non_final_request() {
    let rig = Rig::new();
    let dst = rig.ctl.dst_qent_alloc(&rig.alloc).unwrap();
    rig.submit_into(&dst, &[3; 64], Duration::ZERO, false).unwrap();

    let src_buf = rig.video.last_queued(OUT).unwrap();
    assert_ne!(src_buf.flags & V4L2_BUF_FLAG_M2M_HOLD_CAPTURE_BUF, 0);
}

#[test]
fn test_decoding_error_reported() {
    let rig = Rig::new();
    let dst = rig.submit(&[4; 64], Duration::ZERO).unwrap();
    rig.finish_frame(true);
    assert_eq!(dst.wait(), Err(Error::DecodingError));
    assert_eq!(dst.status(), QentStatus::Error);
}

#[test]
fn test_double_wait_rejected_without_waking() {
    let rig = Rig::new();
    let dst = rig.submit(&[5; 64], Duration::ZERO).unwrap();

    let err = rig.submit_into(&dst, &[6; 64], Duration::ZERO, true).unwrap_err();
    assert!(matches!(err, Error::OperationFailed(_)));

    // The first submission is untouched
    assert!(dst.is_waiting());
    assert_eq!(rig.video.queued_count(CAP), 1);
    assert_eq!(rig.pool.stats().in_flight, 1);
    assert_eq!(rig.pool.stats().available, 3);
    assert_eq!(rig.ctl.src_free_count(), 3);

    rig.finish_frame(false);
    assert!(dst.wait().is_ok());
}

#[test]
fn test_source_queue_failure_unwinds() {
    let rig = Rig::new();
    let dst = rig.ctl.dst_qent_alloc(&rig.alloc).unwrap();

    rig.video.fail_queue(OUT, true);
    let err = rig.submit_into(&dst, &[7; 64], Duration::ZERO, true).unwrap_err();
    assert!(matches!(err, Error::OperationFailed(_)));

    assert!(!dst.is_waiting());
    assert_eq!(dst.status(), QentStatus::Pending);
    assert!(matches!(dst.wait(), Err(Error::OperationFailed(_))));
    assert_eq!(rig.media.reinit_count(), 1);
    assert_eq!(rig.pool.stats().available, 4);
    assert_eq!(rig.ctl.src_free_count(), 4);
    assert_eq!(rig.video.queued_count(CAP), 0);
    assert!(!rig.ctl.is_polling());

    // Everything is reusable
    rig.video.fail_queue(OUT, false);
    rig.submit_into(&dst, &[7; 64], Duration::ZERO, true).unwrap();
    rig.finish_frame(false);
    assert!(dst.wait().is_ok());
}

#[test]
fn test_destination_queue_failure_unwinds() {
    let rig = Rig::new();
    let dst = rig.ctl.dst_qent_alloc(&rig.alloc).unwrap();

    rig.video.fail_queue(CAP, true);
    assert!(rig.submit_into(&dst, &[8; 64], Duration::ZERO, true).is_err());

    assert!(!dst.is_waiting());
    assert_eq!(rig.media.reinit_count(), 1);
    assert_eq!(rig.ctl.src_free_count(), 4);
    assert_eq!(rig.ctl.src_inuse_count(), 0);
    assert_eq!(rig.ctl.dst_inuse_count(), 0);
}

#[test]
fn test_request_queue_failure_orphans_destination() {
    let rig = Rig::new();
    let dst = rig.ctl.dst_qent_alloc(&rig.alloc).unwrap();

    rig.media.fail_queue(true);
    let err = rig.submit_into(&dst, &[9; 64], Duration::ZERO, true).unwrap_err();
    assert!(matches!(err, Error::OperationFailed(_)));

    // The waiter is released but the driver still holds the buffer
    assert!(matches!(dst.wait(), Err(Error::OperationFailed(_))));
    assert_eq!(rig.ctl.src_free_count(), 4);
    assert_eq!(rig.ctl.dst_inuse_count(), 1);
    assert_eq!(rig.pool.stats().available, 4);

    // Its eventual completion carries no result
    assert!(rig.video.complete_next(CAP, false));
    assert!(rig.poll.fire(rig.video.poll_raw_fd(), PollFlags::IN));
    assert_eq!(rig.ctl.dst_inuse_count(), 0);
    assert_ne!(dst.status(), QentStatus::Done);
    assert!(!rig.ctl.is_polling());

    rig.media.fail_queue(false);
    rig.submit_into(&dst, &[9; 64], Duration::from_millis(5), true)
        .unwrap();

    // The stale source the driver still held comes back unmatched
    assert!(rig.video.complete_next(OUT, false));
    assert!(rig.poll.fire(rig.video.poll_raw_fd(), PollFlags::OUT));
    assert_eq!(rig.ctl.src_inuse_count(), 1);
    assert!(rig.ctl.is_polling());

    rig.finish_frame(false);
    assert!(dst.wait().is_ok());
    assert_eq!(dst.timestamp(), Duration::from_millis(5));
}

#[test]
fn test_free_while_queued_recycles_on_dequeue() {
    let rig = Rig::new();
    let dst = rig.submit(&[10; 64], Duration::ZERO).unwrap();
    dst.free();
    assert_eq!(rig.ctl.dst_free_count(), 0);

    rig.finish_frame(false);
    assert_eq!(rig.ctl.dst_free_count(), 1);

    // The recycled slot is handed out again
    let again = rig.ctl.dst_qent_alloc(&rig.alloc).unwrap();
    assert_eq!(again.index(), Some(0));
    assert_eq!(again.status(), QentStatus::New);
}

#[test]
fn test_free_returns_to_controller() {
    let rig = Rig::new();
    let dst = rig.submit(&[11; 64], Duration::ZERO).unwrap();
    rig.finish_frame(false);
    dst.wait().unwrap();
    drop(dst);
    assert_eq!(rig.ctl.dst_free_count(), 1);
}

#[test]
fn test_destination_outlives_controller() {
    let Rig {
        video,
        poll,
        ctl,
        pool,
        alloc,
        ..
    } = Rig::new();
    let dst = ctl.dst_qent_alloc(&alloc).unwrap();
    drop(ctl);

    assert_eq!(poll.task_count(), pool.capacity());
    assert_eq!(video.released_buffer_types(), vec![OUT, CAP]);
    assert_eq!(dst.map_plane(0, |bytes| bytes.len()).unwrap(), dst.plane_size(0));
    dst.free();
}

#[test]
fn test_controller_kept_alive_while_polling() {
    let rig = Rig::new();
    let dst = rig.submit(&[12; 64], Duration::from_millis(3)).unwrap();
    let Rig {
        video, poll, ctl, ..
    } = rig;

    drop(ctl);
    assert!(video.released_buffer_types().is_empty());

    video.complete_frame(false);
    assert!(poll.fire(video.poll_raw_fd(), PollFlags::IN | PollFlags::OUT));
    assert!(dst.wait().is_ok());
    assert_eq!(dst.timestamp(), Duration::from_millis(3));

    // Completion dropped the last reference
    assert_eq!(video.released_buffer_types().len(), 2);
    assert!(!video.is_streaming(OUT));
    drop(dst);
}

#[test]
fn test_poll_timeout_rearms_while_busy() {
    let rig = Rig::new();
    let _dst = rig.submit(&[13; 64], Duration::ZERO).unwrap();
    let fd = rig.video.poll_raw_fd();
    assert_eq!(rig.poll.armed_timeout(fd), Some(Duration::from_secs(2)));

    assert!(rig.poll.fire(fd, PollFlags::empty()));
    assert!(rig.poll.is_armed(fd));
    assert!(rig.ctl.is_polling());
}

#[test]
fn test_error_readiness_pauses_until_stream_on() {
    let rig = Rig::with_video(MockVideoDevice::new(), false);
    let dst = rig.submit(&[15; 64], Duration::ZERO).unwrap();
    let fd = rig.video.poll_raw_fd();
    assert!(rig.ctl.is_polling());

    // Not streaming: the device only reports POLLERR
    assert!(rig.poll.fire(fd, PollFlags::ERR));
    assert!(!rig.poll.is_armed(fd));
    assert!(!rig.ctl.is_polling());
    assert!(dst.is_waiting());

    rig.ctl.stream_on().unwrap();
    assert!(rig.poll.is_armed(fd));
    assert!(rig.ctl.is_polling());

    rig.finish_frame(false);
    dst.wait().unwrap();
}

#[test]
fn test_source_completes_before_destination() {
    let rig = Rig::new();
    let dst = rig.submit(&[14; 64], Duration::ZERO).unwrap();
    let fd = rig.video.poll_raw_fd();

    assert!(rig.video.complete_next(OUT, false));
    assert!(rig.poll.fire(fd, PollFlags::OUT));
    assert_eq!(rig.ctl.src_free_count(), 4);
    assert!(dst.is_waiting());
    assert!(rig.ctl.is_polling());

    assert!(rig.video.complete_next(CAP, false));
    assert!(rig.poll.fire(fd, PollFlags::IN));
    assert!(dst.wait().is_ok());
    assert!(!rig.ctl.is_polling());
}

#[test]
fn test_stream_on_rolls_back_source() {
    let video = MockVideoDevice::new();
    video.fail_stream_on(CAP);
    let rig = Rig::with_video(video, false);

    assert!(matches!(rig.ctl.stream_on(), Err(Error::OperationFailed(_))));
    assert!(!rig.ctl.is_streaming());
    assert_eq!(
        rig.video.stream_calls(),
        vec![(OUT, true), (CAP, true), (OUT, false)]
    );
}

#[test]
fn test_stream_off_attempts_both_directions() {
    let rig = Rig::new();
    let dst = rig.submit(&[15; 64], Duration::ZERO).unwrap();
    rig.video.fail_stream_off(OUT);

    assert!(matches!(rig.ctl.stream_off(), Err(Error::OperationFailed(_))));
    assert!(!rig.ctl.is_streaming());
    assert!(rig.video.stream_calls().contains(&(CAP, false)));

    // The capture side stopped and gave its buffer back without a result
    assert!(matches!(dst.wait(), Err(Error::OperationFailed(_))));
    assert_eq!(rig.ctl.dst_inuse_count(), 0);
    assert_eq!(rig.ctl.src_inuse_count(), 1);
}

#[test]
fn test_stream_off_is_idempotent() {
    let rig = Rig::new();
    rig.ctl.stream_off().unwrap();
    rig.ctl.stream_off().unwrap();
    rig.ctl.stream_on().unwrap();
    rig.ctl.stream_on().unwrap();
    assert_eq!(rig.video.stream_calls().len(), 6);
}

#[test]
fn test_negotiation_prefers_native_formats() {
    let video = MockVideoDevice::new();
    video.clear_capture_formats();
    video.add_capture_format(FourCc::new(b"NV12"), false, 1920, 1080);
    video.add_capture_format(FourCc::new(b"NV21"), true, 3840, 2160);
    let rig = Rig::with_video(video, false);

    assert_eq!(rig.ctl.dst_fmt().pixelformat, FourCc::new(b"NV12"));

    rig.ctl.dst_fmt_set(3840, 2160, |_| true).unwrap();
    let fmt = rig.ctl.dst_fmt();
    assert_eq!(fmt.pixelformat, FourCc::new(b"NV21"));
    assert_eq!((fmt.width, fmt.height), (3840, 2160));

    let err = rig.ctl.dst_fmt_set(1920, 1080, |_| false).unwrap_err();
    assert!(matches!(err, Error::UnsupportedBufferType(_)));
    assert_eq!(rig.ctl.dst_fmt().pixelformat, FourCc::new(b"NV21"));
}

#[test]
fn test_negotiation_consults_predicate() {
    let rig = Rig::new();
    let mut offered = Vec::new();
    let err = rig
        .ctl
        .dst_fmt_set(640, 480, |desc| {
            offered.push((desc.pixelformat, desc.is_emulated()));
            false
        })
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedBufferType(_)));
    assert_eq!(offered, vec![(FourCc::new(b"NV12"), false)]);
}

#[test]
fn test_src_pool_short_grant() {
    let video = MockVideoDevice::new();
    video.limit_grant(2);
    let rig = Rig::with_video(video, false);
    assert_eq!(rig.ctl.src_free_count(), 2);
}

#[test]
fn test_src_pool_allocation_failure_rolls_back() {
    let rig = Rig::new();
    let limited = LimitedAllocator::new(2);

    let err = rig.ctl.src_pool_create(&limited, 4).unwrap_err();
    assert!(matches!(err, Error::OperationFailed(_)));
    assert_eq!(rig.ctl.src_free_count(), 0);
    assert_eq!(rig.video.granted(OUT), 0);
    assert!(rig.video.released_buffer_types().contains(&OUT));
}

#[test]
fn test_single_planar_sources_are_fixed_size() {
    let video = MockVideoDevice::single_planar();
    let poll = ManualPollQueue::new();
    let ctl = MediaBufsCtl::with_device(Box::new(video), &poll.shared(), &MediaConfig::default())
        .unwrap();
    ctl.src_fmt_set(ctl.src_type(), FourCc::new(b"S264"), 1920, 1080, 4096)
        .unwrap();
    let alloc = MemfdAllocator::new();
    ctl.src_pool_create(&alloc, 2).unwrap();

    let mut src = ctl.src_qent_try_get().unwrap();
    assert!(src.is_fixed_size());
    assert_eq!(src.plane_size(), 4096);
    let err = src.copy_in(0, &[0u8; 5000], &alloc).unwrap_err();
    assert!(matches!(err, Error::AllocationFailed(_)));
    src.copy_in(0, &[0u8; 4096], &alloc).unwrap();
    ctl.src_qent_abort(src);
    assert_eq!(ctl.src_free_count(), 2);
}

#[test]
fn test_multiplanar_sources_grow() {
    let rig = Rig::new();
    let mut src = rig.ctl.src_qent_get();
    assert!(!src.is_fixed_size());
    let big = vec![0u8; src.plane_size() + 1];
    src.copy_in(0, &big, &rig.alloc).unwrap();
    assert!(src.plane_size() >= big.len());
    assert_eq!(src.len(), big.len());
}

#[test]
fn test_src_get_timeout_when_exhausted() {
    let rig = Rig::new();
    let held: Vec<_> = (0..4).map(|_| rig.ctl.src_qent_get()).collect();
    assert!(rig.ctl.src_qent_try_get().is_none());
    assert!(rig.ctl.src_qent_get_timeout(Duration::from_millis(10)).is_none());
    drop(held);
    assert_eq!(rig.ctl.src_free_count(), 4);
}

#[test]
fn test_dst_slots_then_alloc() {
    let video = MockVideoDevice::new();
    video.set_capture_planes(2);
    let rig = Rig::with_video(video, false);

    rig.ctl.dst_slots_create(3).unwrap();
    assert_eq!(rig.ctl.dst_free_count(), 3);

    let dst = rig.ctl.dst_qent_alloc(&rig.alloc).unwrap();
    assert_eq!(rig.ctl.dst_free_count(), 2);
    assert_eq!(dst.index(), Some(0));
    assert_eq!(dst.plane_count(), 2);
    assert!(dst.plane_size(1) > 0);
    assert!(dst.dup_plane_fd(1).is_ok());
}

#[test]
fn test_dst_alloc_failure_parks_slot() {
    let rig = Rig::new();
    let limited = LimitedAllocator::new(0);
    let err = rig.ctl.dst_qent_alloc(&limited).unwrap_err();
    assert!(matches!(err, Error::AllocationFailed(_)));
    assert_eq!(rig.ctl.dst_free_count(), 1);

    rig.video.fail_create(true);
    let dst = rig.ctl.dst_qent_alloc(&rig.alloc).unwrap();
    assert_eq!(dst.index(), Some(0));
    assert!(rig.ctl.dst_qent_alloc(&rig.alloc).is_err());
}

#[test]
fn test_foreign_destination_rejected() {
    let rig = Rig::new();
    let other = Rig::new();
    let foreign = other.ctl.dst_qent_alloc(&other.alloc).unwrap();
    assert!(rig.submit_into(&foreign, &[1; 8], Duration::ZERO, true).is_err());
    assert!(!foreign.is_waiting());
    assert_eq!(rig.ctl.src_free_count(), 4);

    let imported = QentDst::new_import();
    assert!(rig.submit_into(&imported, &[1; 8], Duration::ZERO, true).is_err());
    assert_eq!(rig.pool.stats().available, 4);
}

#[test]
fn test_request_without_destination() {
    let rig = Rig::new();
    let req = rig.pool.acquire();
    let mut src = rig.ctl.src_qent_get();
    src.copy_in(0, &[1; 32], &rig.alloc).unwrap();
    rig.ctl.start_request(req, src, None, true).unwrap();

    assert_eq!(rig.video.queued_count(CAP), 0);
    assert!(rig.video.complete_next(OUT, false));
    assert!(rig.poll.fire(rig.video.poll_raw_fd(), PollFlags::OUT));
    assert_eq!(rig.ctl.src_free_count(), 4);
}

#[test]
fn test_controls_and_events() {
    let rig = Rig::new();
    rig.ctl
        .set_ext_ctrls(None, &mut [ExtControl::int(MOCK_CTRL_DECODE_MODE, 1)])
        .unwrap();
    assert_eq!(rig.video.control(MOCK_CTRL_DECODE_MODE), Some(CtrlValue::I32(1)));

    let mut read = [ExtControl::int(MOCK_CTRL_DECODE_MODE, 0)];
    rig.ctl.get_ext_ctrls(&mut read).unwrap();
    assert_eq!(read[0].value, CtrlValue::I32(1));

    assert!(rig.ctl.set_ext_ctrl(None, 0xdead_beef, &[0; 4]).is_err());

    rig.ctl
        .subscribe_event(V4L2_EVENT_SOURCE_CHANGE, 0)
        .unwrap();
    assert_eq!(rig.video.events(), vec![(V4L2_EVENT_SOURCE_CHANGE, 0)]);
}

#[test]
fn test_arm_failure_fails_submission() {
    let rig = Rig::new();
    rig.poll.fail_arm(true);
    let dst = rig.ctl.dst_qent_alloc(&rig.alloc).unwrap();
    let err = rig.submit_into(&dst, &[1; 8], Duration::ZERO, true).unwrap_err();
    assert!(matches!(err, Error::OperationFailed(_)));

    // The request never reached the kernel, so it and its source are free
    assert_eq!(rig.media.queued_count(), 0);
    assert_eq!(rig.pool.stats().available, 4);
    assert_eq!(rig.ctl.src_free_count(), 4);
    assert_eq!(rig.ctl.src_inuse_count(), 0);
    assert!(!rig.ctl.is_polling());
    assert!(matches!(dst.wait(), Err(Error::OperationFailed(_))));
}

#[test]
fn test_queued_request_never_available() {
    let rig = Rig::new();
    let _dst = rig.submit(&[2; 8], Duration::ZERO).unwrap();
    let queued = rig.media.queued_fds();
    assert_eq!(queued.len(), 1);

    // Every other request can be taken, but not the queued one
    let held: Vec<_> = (0..3).map(|_| rig.pool.acquire()).collect();
    assert!(held.iter().all(|req| req.raw_fd() != queued[0]));
    assert!(rig.pool.try_acquire().is_none());
    assert_eq!(rig.pool.stats().in_flight, 1);
}
