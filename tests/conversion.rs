//! End-to-end conversion pipeline tests with mock codec engines

use std::sync::Arc;

use bytes::Bytes;
use mediamux::{
  AudioCodec, AudioTrackConfig, BufferSource, BufferWriter, Conversion, ConversionOptions,
  DecoderRegistry, Demuxer, EncodedPacket, EncoderRegistry, Error, MatroskaMuxer,
  MatroskaMuxerOptions, MatroskaVariant, OutputFormat, PacketType, Mp4MuxerOptions,
  PacketRetrievalOptions, Result, TrackInfo, VideoCodec, VideoDecoder, VideoDecoderConfig,
  VideoEncoder, VideoEncoderConfig, VideoSample, VideoTrackConfig,
};

// ============================================================================
// Mock engines
// ============================================================================

/// Decoder producing flat RGBA frames sized to the configuration
struct MockVideoDecoder {
  width: u32,
  height: u32,
}

impl VideoDecoder for MockVideoDecoder {
  fn configure(&mut self, config: &VideoDecoderConfig) -> Result<()> {
    self.width = config.coded_width;
    self.height = config.coded_height;
    Ok(())
  }

  fn decode(&mut self, packet: &EncodedPacket) -> Result<Vec<VideoSample>> {
    let fill = packet.data.first().copied().unwrap_or(0);
    Ok(vec![VideoSample {
      data: Bytes::from(vec![fill; (self.width * self.height * 4) as usize]),
      coded_width: self.width,
      coded_height: self.height,
      timestamp: packet.timestamp,
      duration: packet.duration,
    }])
  }

  fn flush(&mut self) -> Result<Vec<VideoSample>> {
    Ok(Vec::new())
  }

  fn close(&mut self) {}
}

/// Encoder emitting one packet per frame, keying on request
#[derive(Default)]
struct MockVideoEncoder {
  frame_index: u64,
}

impl VideoEncoder for MockVideoEncoder {
  fn configure(&mut self, _config: &VideoEncoderConfig) -> Result<()> {
    Ok(())
  }

  fn encode(&mut self, sample: &VideoSample, key_frame: bool) -> Result<Vec<EncodedPacket>> {
    let key = key_frame || self.frame_index % 30 == 0;
    self.frame_index += 1;
    Ok(vec![EncodedPacket::new(
      Bytes::from(vec![sample.data.first().copied().unwrap_or(0); 24]),
      if key { PacketType::Key } else { PacketType::Delta },
      sample.timestamp,
      sample.duration,
      self.frame_index as i64 - 1,
    )])
  }

  fn flush(&mut self) -> Result<Vec<EncodedPacket>> {
    Ok(Vec::new())
  }

  fn close(&mut self) {}
}

fn packet(timestamp: f64, duration: f64, key: bool, payload: Vec<u8>) -> EncodedPacket {
  EncodedPacket::new(
    Bytes::from(payload),
    if key { PacketType::Key } else { PacketType::Delta },
    timestamp,
    duration,
    0,
  )
}

/// A 30 s HEVC-in-MKV input, 5 fps with a key frame every second
fn build_hevc_mkv() -> Vec<u8> {
  let mut muxer = MatroskaMuxer::new(BufferWriter::new(), MatroskaMuxerOptions::default());
  let video = muxer
    .add_video_track(VideoTrackConfig::new(VideoCodec::Hevc, 320, 180))
    .unwrap();
  for i in 0..150u32 {
    let t = f64::from(i) / 5.0;
    muxer
      .add_packet(video, &packet(t, 0.2, i % 5 == 0, vec![i as u8; 40]))
      .unwrap();
  }
  muxer.finalize().unwrap();
  muxer.into_writer().into_bytes().to_vec()
}

/// A 3 s VP9+Opus WebM input
fn build_vp9_opus_webm() -> (Vec<u8>, usize) {
  let mut muxer = MatroskaMuxer::new(
    BufferWriter::new(),
    MatroskaMuxerOptions {
      variant: MatroskaVariant::Webm,
      streaming: false,
    },
  );
  let video = muxer
    .add_video_track(VideoTrackConfig::new(VideoCodec::Vp9, 1280, 720))
    .unwrap();
  let audio = muxer
    .add_audio_track(AudioTrackConfig::new(AudioCodec::Opus, 48_000, 2))
    .unwrap();
  let mut payload_bytes = 0usize;
  for i in 0..90u8 {
    let t = f64::from(i) / 30.0;
    muxer
      .add_packet(video, &packet(t, 1.0 / 30.0, i % 30 == 0, vec![0x40 | (i & 0xF); 50]))
      .unwrap();
    muxer
      .add_packet(audio, &packet(t, 1.0 / 30.0, true, vec![0x20; 16]))
      .unwrap();
    payload_bytes += 50 + 16;
  }
  muxer.finalize().unwrap();
  (muxer.into_writer().into_bytes().to_vec(), payload_bytes)
}

// ============================================================================
// Scenario: MKV HEVC → MP4 AVC with resize and trim
// ============================================================================

#[tokio::test]
async fn test_transcode_hevc_mkv_to_avc_mp4_with_trim() {
  let input = Demuxer::open(Box::new(BufferSource::new(build_hevc_mkv())))
    .await
    .unwrap();

  let mut decoders = DecoderRegistry::new();
  decoders.register_video(
    |codec, _| codec == VideoCodec::Hevc,
    || {
      Box::new(MockVideoDecoder {
        width: 320,
        height: 180,
      })
    },
  );
  // Only an AVC encoder capped below the source size is available
  let mut encoders = EncoderRegistry::new();
  encoders.register_video(
    |codec, config| codec == VideoCodec::Avc && config.width <= 160,
    || Box::<MockVideoEncoder>::default(),
  );

  let options = ConversionOptions {
    trim: Some((10.0, 25.0)),
    video: mediamux::VideoConversionOptions {
      width: Some(160),
      height: Some(90),
      ..Default::default()
    },
    ..Default::default()
  };

  let conversion = Conversion::new(
    input,
    BufferWriter::new(),
    OutputFormat::Mp4(Mp4MuxerOptions {
      creation_time: Some(0),
      ..Default::default()
    }),
    options,
    Arc::new(decoders),
    Arc::new(encoders),
  );
  let result = conversion.execute().await.unwrap();
  assert_eq!(result.utilized_tracks, vec![1]);

  // The output opens as MP4 with an AVC track at the requested size
  let bytes = result.writer.into_bytes();
  let mut output = Demuxer::open(Box::new(BufferSource::new(bytes.to_vec())))
    .await
    .unwrap();
  let tracks = output.tracks();
  assert_eq!(tracks.len(), 1);
  let video = match &tracks[0] {
    TrackInfo::Video(v) => v,
    TrackInfo::Audio(_) => panic!("expected a video track"),
  };
  assert_eq!(video.codec, VideoCodec::Avc);
  assert_eq!((video.coded_width, video.coded_height), (160, 90));

  // Trim re-bases timestamps: the first packet sits at 0, total ≤ 15 s
  let first = output
    .first_packet(1, PacketRetrievalOptions::default())
    .await
    .unwrap()
    .unwrap();
  assert!(first.timestamp.abs() < 1e-6);
  let duration = output.compute_duration().await.unwrap();
  assert!(duration <= 15.0 + 0.21, "duration {duration}");
  assert!(duration > 14.0, "duration {duration}");
}

// ============================================================================
// Scenario: WebM VP9+Opus → MP4, both tracks copied
// ============================================================================

#[tokio::test]
async fn test_copy_webm_to_mp4_without_codecs() {
  let (input_bytes, payload_bytes) = build_vp9_opus_webm();
  let input = Demuxer::open(Box::new(BufferSource::new(input_bytes)))
    .await
    .unwrap();

  // Empty registries: the fast path must not instantiate any codec engine
  let conversion = Conversion::new(
    input,
    BufferWriter::new(),
    OutputFormat::Mp4(Mp4MuxerOptions {
      creation_time: Some(0),
      ..Default::default()
    }),
    ConversionOptions::default(),
    Arc::new(DecoderRegistry::new()),
    Arc::new(EncoderRegistry::new()),
  );
  let result = conversion.execute().await.unwrap();
  assert_eq!(result.utilized_tracks, vec![1, 2]);
  assert!(result.discarded_tracks.is_empty());

  let bytes = result.writer.into_bytes();
  // Container overhead stays modest over the raw payload
  assert!(bytes.len() > payload_bytes);
  assert!(bytes.len() < payload_bytes + 16 * 1024);

  let mut output = Demuxer::open(Box::new(BufferSource::new(bytes.to_vec())))
    .await
    .unwrap();
  let tracks = output.tracks();
  assert_eq!(tracks.len(), 2);
  assert!(matches!(
    &tracks[0],
    TrackInfo::Video(v) if v.codec == VideoCodec::Vp9
  ));
  assert!(matches!(
    &tracks[1],
    TrackInfo::Audio(a) if a.codec == AudioCodec::Opus
  ));

  // Packet payloads survive the round trip byte for byte
  let options = PacketRetrievalOptions::default();
  let mut packet = output.first_packet(1, options).await.unwrap().unwrap();
  let mut count = 1;
  assert_eq!(packet.data.as_ref(), &[0x40u8; 50][..]);
  while let Some(next) = output.next_packet(1, &packet, options).await.unwrap() {
    packet = next;
    count += 1;
  }
  assert_eq!(count, 90);
}

// ============================================================================
// Discards and cancellation
// ============================================================================

#[tokio::test]
async fn test_discard_reasons_are_reported() {
  let input = Demuxer::open(Box::new(BufferSource::new(build_hevc_mkv())))
    .await
    .unwrap();
  // No decoder registered for HEVC and a forced transcode: the track is
  // undecodable
  let conversion = Conversion::new(
    input,
    BufferWriter::new(),
    OutputFormat::Mp4(Mp4MuxerOptions::default()),
    ConversionOptions {
      video: mediamux::VideoConversionOptions {
        force_transcode: true,
        ..Default::default()
      },
      ..Default::default()
    },
    Arc::new(DecoderRegistry::new()),
    Arc::new(EncoderRegistry::new()),
  );
  match conversion.execute().await {
    Err(Error::UnsupportedFeature(_)) => {}
    other => panic!("expected no-usable-track failure, got {other:?}"),
  }
}

#[tokio::test]
async fn test_cancel_before_start() {
  let (input_bytes, _) = build_vp9_opus_webm();
  let input = Demuxer::open(Box::new(BufferSource::new(input_bytes)))
    .await
    .unwrap();
  let conversion = Conversion::new(
    input,
    BufferWriter::new(),
    OutputFormat::Mp4(Mp4MuxerOptions::default()),
    ConversionOptions::default(),
    Arc::new(DecoderRegistry::new()),
    Arc::new(EncoderRegistry::new()),
  );
  let handle = conversion.cancel_handle();
  handle.cancel();
  match conversion.execute().await {
    Err(Error::Canceled) => {}
    other => panic!("expected cancellation, got {other:?}"),
  }
}

#[tokio::test]
async fn test_progress_reaches_completion() {
  let (input_bytes, _) = build_vp9_opus_webm();
  let input = Demuxer::open(Box::new(BufferSource::new(input_bytes)))
    .await
    .unwrap();
  let mut conversion = Conversion::new(
    input,
    BufferWriter::new(),
    OutputFormat::Mp4(Mp4MuxerOptions::default()),
    ConversionOptions::default(),
    Arc::new(DecoderRegistry::new()),
    Arc::new(EncoderRegistry::new()),
  );
  let progress = Arc::new(std::sync::Mutex::new(Vec::new()));
  {
    let progress = progress.clone();
    conversion.on_progress(move |value| progress.lock().unwrap().push(value));
  }
  conversion.execute().await.unwrap();
  let reports = progress.lock().unwrap();
  assert!(!reports.is_empty());
  assert!(reports.iter().all(|v| (0.0..=1.0).contains(v)));
  assert!(reports.last().copied().unwrap() > 0.9);
}
