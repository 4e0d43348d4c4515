//! Cross-format round-trip fidelity
//!
//! Mux a packet sequence, demux it, remux into the other container, demux
//! again, and compare payloads, types, and timestamps against the originals.

use bytes::Bytes;
use mediamux::{
  AudioCodec, AudioTrackConfig, BufferSource, BufferWriter, Demuxer, EncodedPacket,
  MatroskaMuxer, MatroskaMuxerOptions, Mp4LayoutMode, Mp4Muxer, Mp4MuxerOptions, PacketType,
  PacketRetrievalOptions, VideoCodec, VideoTrackConfig,
};

struct SourcePacket {
  timestamp: f64,
  duration: f64,
  key: bool,
  payload: Vec<u8>,
}

fn video_source(seconds: u32, fps: u32, gop: u32) -> Vec<SourcePacket> {
  (0..seconds * fps)
    .map(|i| SourcePacket {
      timestamp: f64::from(i) / f64::from(fps),
      duration: 1.0 / f64::from(fps),
      key: i % gop == 0,
      payload: vec![(i % 251) as u8; 48 + (i % 7) as usize],
    })
    .collect()
}

fn audio_source(seconds: u32) -> Vec<SourcePacket> {
  // 20 ms Opus-style packets
  (0..seconds * 50)
    .map(|i| SourcePacket {
      timestamp: f64::from(i) * 0.02,
      duration: 0.02,
      key: true,
      payload: vec![(0x80 | (i % 0x7F)) as u8; 24],
    })
    .collect()
}

async fn collect_track(demuxer: &mut Demuxer, track_id: u32) -> Vec<EncodedPacket> {
  let options = PacketRetrievalOptions::default();
  let mut out = Vec::new();
  let Some(mut packet) = demuxer.first_packet(track_id, options).await.unwrap() else {
    return out;
  };
  loop {
    out.push(packet.clone());
    match demuxer.next_packet(track_id, &packet, options).await.unwrap() {
      Some(next) => packet = next,
      None => break,
    }
  }
  out
}

fn assert_matches_source(packets: &[EncodedPacket], source: &[SourcePacket], tolerance: f64) {
  assert_eq!(packets.len(), source.len());
  for (got, want) in packets.iter().zip(source) {
    assert_eq!(got.data.as_ref(), want.payload.as_slice());
    assert_eq!(got.packet_type, if want.key { PacketType::Key } else { PacketType::Delta });
    assert!(
      (got.timestamp - want.timestamp).abs() <= tolerance,
      "timestamp {} vs {}",
      got.timestamp,
      want.timestamp
    );
    assert!(
      (got.duration - want.duration).abs() <= tolerance,
      "duration {} vs {}",
      got.duration,
      want.duration
    );
  }
}

#[tokio::test]
async fn test_mp4_to_mkv_to_mp4_preserves_packets() {
  let video = video_source(3, 30, 30);
  let audio = audio_source(3);

  // First generation: faststart MP4
  let mut muxer = Mp4Muxer::new(
    BufferWriter::new(),
    Mp4MuxerOptions {
      layout: Mp4LayoutMode::FastStartInMemory,
      creation_time: Some(0),
    },
  );
  let v = muxer
    .add_video_track(VideoTrackConfig::new(VideoCodec::Avc, 1280, 720))
    .unwrap();
  let a = muxer
    .add_audio_track(AudioTrackConfig::new(AudioCodec::Opus, 48_000, 2))
    .unwrap();
  for p in &video {
    muxer
      .add_packet(
        v,
        &EncodedPacket::new(
          Bytes::from(p.payload.clone()),
          if p.key { PacketType::Key } else { PacketType::Delta },
          p.timestamp,
          p.duration,
          0,
        ),
      )
      .unwrap();
  }
  for p in &audio {
    muxer
      .add_packet(
        a,
        &EncodedPacket::new(Bytes::from(p.payload.clone()), PacketType::Key, p.timestamp, p.duration, 0),
      )
      .unwrap();
  }
  muxer.finalize().unwrap();
  let mp4_bytes = muxer.into_writer().into_bytes().to_vec();

  // Demux generation one; MP4 timescales keep timestamps near-exact
  let mut demuxer = Demuxer::open(Box::new(BufferSource::new(mp4_bytes))).await.unwrap();
  let video_packets = collect_track(&mut demuxer, 1).await;
  let audio_packets = collect_track(&mut demuxer, 2).await;
  assert_matches_source(&video_packets, &video, 1.0 / 48_000.0);
  assert_matches_source(&audio_packets, &audio, 1.0 / 48_000.0);

  // Second generation: remux into Matroska
  let mut remuxer = MatroskaMuxer::new(BufferWriter::new(), MatroskaMuxerOptions::default());
  let v2 = remuxer
    .add_video_track(VideoTrackConfig::new(VideoCodec::Avc, 1280, 720))
    .unwrap();
  let a2 = remuxer
    .add_audio_track(AudioTrackConfig::new(AudioCodec::Opus, 48_000, 2))
    .unwrap();
  for p in &video_packets {
    remuxer.add_packet(v2, p).unwrap();
  }
  for p in &audio_packets {
    remuxer.add_packet(a2, p).unwrap();
  }
  remuxer.finalize().unwrap();
  let mkv_bytes = remuxer.into_writer().into_bytes().to_vec();

  // Demux generation two; Matroska rounds timestamps to milliseconds
  let mut demuxer = Demuxer::open(Box::new(BufferSource::new(mkv_bytes))).await.unwrap();
  let video_packets = collect_track(&mut demuxer, 1).await;
  let audio_packets = collect_track(&mut demuxer, 2).await;
  assert_matches_source(&video_packets, &video, 1e-3);
  assert_matches_source(&audio_packets, &audio, 1e-3);
}

#[tokio::test]
async fn test_fragmented_mp4_round_trip_counts() {
  let video = video_source(4, 30, 30);
  let mut muxer = Mp4Muxer::new(
    BufferWriter::new(),
    Mp4MuxerOptions {
      layout: Mp4LayoutMode::Fragmented,
      creation_time: Some(0),
    },
  );
  let v = muxer
    .add_video_track(VideoTrackConfig::new(VideoCodec::Avc, 640, 360))
    .unwrap();
  for p in &video {
    muxer
      .add_packet(
        v,
        &EncodedPacket::new(
          Bytes::from(p.payload.clone()),
          if p.key { PacketType::Key } else { PacketType::Delta },
          p.timestamp,
          p.duration,
          0,
        ),
      )
      .unwrap();
  }
  muxer.finalize().unwrap();
  let bytes = muxer.into_writer().into_bytes().to_vec();

  let mut demuxer = Demuxer::open(Box::new(BufferSource::new(bytes))).await.unwrap();
  let packets = collect_track(&mut demuxer, 1).await;
  assert_matches_source(&packets, &video, 1.0 / 48_000.0);
  let duration = demuxer.compute_duration().await.unwrap();
  assert!((duration - 4.0).abs() < 1e-3);
}
