//! Stateless decode loop against a real V4L2 request-API decoder.
//!
//! Feeds length-prefixed access units (4-byte big-endian length, then the
//! payload) to the decoder, one request per unit, and writes each decoded
//! picture's planes to an output file.
//!
//! Run with:
//! `cargo run --example stateless_decode -- <input> <output> [S264|MG2S|VP8F] [width] [height]`
//!
//! Per-frame codec controls (SPS, PPS, slice parameters) come from a
//! bitstream parser that lives outside this crate; without them most drivers
//! flag every frame as an error. The loop still exercises the full request
//! and buffer lifecycle.
//!
//! Requirements:
//! - Linux with a stateless decoder at `/dev/video0` and `/dev/media0`
//!   (override with `MEDIABUFS_VIDEO` and `MEDIABUFS_MEDIA`)
//! - Access to a DMA heap under `/dev/dma_heap`

use mediabufs::prelude::*;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::sync::Arc;
use std::time::Duration;

fn read_unit(input: &mut impl Read) -> std::io::Result<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match input.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut unit = vec![0u8; u32::from_be_bytes(len) as usize];
    input.read_exact(&mut unit)?;
    Ok(Some(unit))
}

fn write_picture(dst: &QentDst, out: &mut impl Write) -> Result<()> {
    dst.read_start()?;
    for plane in 0..dst.plane_count() {
        dst.map_plane(plane, |data| out.write_all(data))??;
    }
    dst.read_stop()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mediabufs=info,warn".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!(
            "usage: {} <input> <output> [codec fourcc] [width] [height]",
            args[0]
        );
        std::process::exit(2);
    }
    let codec = args
        .get(3)
        .and_then(|s| <[u8; 4]>::try_from(s.as_bytes()).ok())
        .map(|b| FourCc::new(&b))
        .unwrap_or(FourCc::new(b"S264"));
    let width: u32 = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(1920);
    let height: u32 = args.get(5).and_then(|s| s.parse().ok()).unwrap_or(1080);

    let mut config = MediaConfig::default();
    if let Ok(path) = std::env::var("MEDIABUFS_VIDEO") {
        config = config.with_video_path(path);
    }
    if let Ok(path) = std::env::var("MEDIABUFS_MEDIA") {
        config = config.with_media_path(path);
    }

    let poll: Arc<dyn PollQueue> = Arc::new(ThreadPollQueue::new()?);
    let heap = DmaHeapAllocator::new()?;
    println!("Allocating from {}", heap.path().display());

    let ctl = MediaBufsCtl::open(&config, &poll)?;
    let caps = ctl.capabilities();
    println!("Decoder: {} ({}) on {}", caps.card, caps.driver, caps.bus_info);

    ctl.src_fmt_set(ctl.src_type(), codec, width, height, 0)?;
    ctl.dst_fmt_set(width, height, |desc| {
        desc.pixelformat == FourCc::new(b"NV12")
    })?;
    let dst_fmt = ctl.dst_fmt();
    println!(
        "Decoding {} {}x{} to {} ({} plane(s))",
        codec,
        dst_fmt.width,
        dst_fmt.height,
        dst_fmt.pixelformat,
        dst_fmt.num_planes()
    );

    ctl.src_pool_create(&heap, config.src_buffer_count)?;
    ctl.dst_slots_create(config.dst_slot_count)?;
    ctl.stream_on()?;

    let requests = MediaPool::new(&config, &poll)?;

    let mut input = BufReader::new(File::open(&args[1])?);
    let mut output = BufWriter::new(File::create(&args[2])?);
    let frame_period = Duration::from_micros(33_333);

    let mut frames = 0u64;
    let mut errors = 0u64;
    while let Some(unit) = read_unit(&mut input)? {
        let req = requests.acquire();
        let mut src = ctl.src_qent_get();
        src.copy_in(0, &unit, &heap)?;
        src.params_set(frame_period * frames as u32);

        let dst = ctl.dst_qent_alloc(&heap)?;
        ctl.start_request(req, src, Some(&dst), true)?;

        match dst.wait() {
            Ok(()) => write_picture(&dst, &mut output)?,
            Err(Error::DecodingError) => {
                errors += 1;
                tracing::warn!(frame = frames, "decoder flagged frame as corrupt");
            }
            Err(e) => return Err(e),
        }
        frames += 1;
    }
    output.flush()?;

    ctl.stream_off()?;
    println!("Decoded {} frame(s), {} with errors", frames - errors, errors);
    Ok(())
}
