//! Pure transforms from a `(current, previous, elapsed)` pair of records into
//! derived rate metrics.
//!
//! Every function writes onto its `target` and touches nothing else, so each
//! can be exercised with two synthetic records and an elapsed time. Rates are
//! only produced when a previous record of the same category is available;
//! values the transport already reports as instantaneous (remote fraction
//! lost, round-trip time, jitter) are copied as-is.

use super::types::{
    CandidatePairMetrics, CandidatePairStats, Direction, InboundRtpStats, MediaKind,
    OutboundRtpStats, RemoteInboundRtpStats, SsrcMetrics, StatRecord, StatsReport,
};

#[inline]
fn delta(current: u64, previous: u64) -> f64 {
    current.saturating_sub(previous) as f64
}

#[inline]
fn delta_f64(current: f64, previous: f64) -> f64 {
    (current - previous).max(0.0)
}

#[inline]
fn per_second(delta: f64, elapsed_ms: f64) -> f64 {
    1000.0 * delta / elapsed_ms
}

#[inline]
fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// `8000 × Δbytes / elapsedMs`
#[inline]
pub fn bitrate(current_bytes: u64, previous_bytes: u64, elapsed_ms: f64) -> f64 {
    8000.0 * delta(current_bytes, previous_bytes) / elapsed_ms
}

/// Media kind of an RTP record, falling back to its media source or codec.
pub fn record_kind(record: &StatRecord, report: &StatsReport) -> Option<MediaKind> {
    let (kind, codec_id, media_source_id) = match record {
        StatRecord::InboundRtp(stats) => (stats.kind, stats.codec_id.as_deref(), None),
        StatRecord::OutboundRtp(stats) => (
            stats.kind,
            stats.codec_id.as_deref(),
            stats.media_source_id.as_deref(),
        ),
        StatRecord::RemoteInboundRtp(stats) => (stats.kind, None, None),
        StatRecord::MediaSource(stats) => (stats.kind, None, None),
        _ => (None, None, None),
    };

    kind.or_else(|| match media_source_id.and_then(|id| report.get(id)) {
        Some(StatRecord::MediaSource(source)) => source.kind,
        _ => None,
    })
    .or_else(|| match codec_id.and_then(|id| report.get(id)) {
        Some(StatRecord::Codec(codec)) if codec.mime_type.starts_with("video/") => {
            Some(MediaKind::Video)
        }
        Some(StatRecord::Codec(codec)) if codec.mime_type.starts_with("audio/") => {
            Some(MediaKind::Audio)
        }
        _ => None,
    })
}

fn codec_description(codec_id: Option<&str>, report: &StatsReport) -> Option<String> {
    let Some(StatRecord::Codec(codec)) = report.get(codec_id?) else {
        return None;
    };

    let mut description = codec.mime_type.clone();
    if let Some(clock_rate) = codec.clock_rate {
        description.push_str(&format!("/{clock_rate}"));
    }
    if let Some(channels) = codec.channels {
        description.push_str(&format!("/{channels}"));
    }
    Some(description)
}

/// Receiver report paired with an outbound stream: by `remoteId`, or by ssrc.
fn remote_inbound<'a>(
    outbound: &OutboundRtpStats,
    report: &'a StatsReport,
) -> Option<&'a RemoteInboundRtpStats> {
    if let Some(StatRecord::RemoteInboundRtp(remote)) =
        outbound.remote_id.as_deref().and_then(|id| report.get(id))
    {
        return Some(remote);
    }

    report.values().find_map(|record| match record {
        StatRecord::RemoteInboundRtp(remote) if remote.ssrc == outbound.ssrc => Some(remote),
        _ => None,
    })
}

/// Identity and descriptive fields. Needs no previous record.
pub fn extract_info(target: &mut SsrcMetrics, current: &StatRecord, report: &StatsReport) {
    target.kind = record_kind(current, report).or(target.kind);

    match current {
        StatRecord::InboundRtp(stats) => {
            target.ssrc = stats.ssrc;
            target.direction = Some(Direction::In);
            target.track_id = stats.track_identifier.clone().or(target.track_id.take());
            target.mid = stats.mid.clone();
            target.codec = codec_description(stats.codec_id.as_deref(), report);
            target.width = stats.frame_width;
            target.height = stats.frame_height;
            target.audio_level = stats.audio_level;
        }
        StatRecord::OutboundRtp(stats) => {
            target.ssrc = stats.ssrc;
            target.direction = Some(Direction::Out);
            target.rid = stats.rid.clone();
            target.codec = codec_description(stats.codec_id.as_deref(), report);
            target.quality_limitation_reason = stats.quality_limitation_reason.clone();

            let source = match stats.media_source_id.as_deref().and_then(|id| report.get(id)) {
                Some(StatRecord::MediaSource(source)) => Some(source),
                _ => None,
            };
            if let Some(track_id) = source.and_then(|source| source.track_identifier.clone()) {
                target.track_id = Some(track_id);
            }
            target.width = stats.frame_width.or(source.and_then(|source| source.width));
            target.height = stats.frame_height.or(source.and_then(|source| source.height));
            target.audio_level = source.and_then(|source| source.audio_level);
        }
        _ => (),
    }
}

/// Bitrate, packet rates and loss. Remote-reported values for outbound
/// streams are read even without a previous record.
pub fn extract_common(
    target: &mut SsrcMetrics,
    current: &StatRecord,
    previous: Option<&StatRecord>,
    elapsed_ms: f64,
    report: &StatsReport,
) {
    match (current, previous) {
        (StatRecord::InboundRtp(current), previous) => {
            target.jitter = Some(current.jitter);

            let Some(StatRecord::InboundRtp(previous)) = previous else {
                return;
            };
            extract_inbound_common(target, current, previous, elapsed_ms);
        }
        (StatRecord::OutboundRtp(current), previous) => {
            target.fraction_lost = None;
            target.round_trip_time = None;
            target.jitter = None;
            if let Some(remote) = remote_inbound(current, report) {
                target.fraction_lost = Some(remote.fraction_lost);
                target.round_trip_time = remote.round_trip_time;
                target.jitter = Some(remote.jitter);
            }

            let Some(StatRecord::OutboundRtp(previous)) = previous else {
                return;
            };
            target.bitrate = Some(bitrate(
                current.bytes_sent + current.header_bytes_sent,
                previous.bytes_sent + previous.header_bytes_sent,
                elapsed_ms,
            ));
            target.packet_rate = Some(per_second(
                delta(current.packets_sent, previous.packets_sent),
                elapsed_ms,
            ));
            target.pli_rate = Some(per_second(
                delta(current.pli_count, previous.pli_count),
                elapsed_ms,
            ));
            target.nack_rate = Some(per_second(
                delta(current.nack_count, previous.nack_count),
                elapsed_ms,
            ));
        }
        _ => (),
    }
}

fn extract_inbound_common(
    target: &mut SsrcMetrics,
    current: &InboundRtpStats,
    previous: &InboundRtpStats,
    elapsed_ms: f64,
) {
    target.bitrate = Some(bitrate(
        current.bytes_received + current.header_bytes_received,
        previous.bytes_received + previous.header_bytes_received,
        elapsed_ms,
    ));

    let packets_received = delta(current.packets_received, previous.packets_received);
    let packets_lost = (current.packets_lost - previous.packets_lost).max(0) as f64;
    target.packet_rate = Some(per_second(packets_received, elapsed_ms));
    target.packet_loss = Some(
        ratio(
            1000.0 * packets_lost,
            packets_lost + packets_received,
        ) / elapsed_ms,
    );

    target.jitter_buffer_delay = Some(ratio(
        delta_f64(current.jitter_buffer_delay, previous.jitter_buffer_delay),
        delta(
            current.jitter_buffer_emitted_count,
            previous.jitter_buffer_emitted_count,
        ),
    ));
    target.pli_rate = Some(per_second(
        delta(current.pli_count, previous.pli_count),
        elapsed_ms,
    ));
    target.nack_rate = Some(per_second(
        delta(current.nack_count, previous.nack_count),
        elapsed_ms,
    ));
}

/// Frame rate, quantizer per frame and key-frame rate.
pub fn extract_video(
    target: &mut SsrcMetrics,
    current: &StatRecord,
    previous: Option<&StatRecord>,
    elapsed_ms: f64,
    _report: &StatsReport,
) {
    let (frames, keyframes, qp_sum) = match (current, previous) {
        (StatRecord::InboundRtp(current), Some(StatRecord::InboundRtp(previous))) => (
            delta(current.frames_decoded, previous.frames_decoded),
            delta(current.key_frames_decoded, previous.key_frames_decoded),
            delta(current.qp_sum, previous.qp_sum),
        ),
        (StatRecord::OutboundRtp(current), Some(StatRecord::OutboundRtp(previous))) => (
            delta(current.frames_encoded, previous.frames_encoded),
            delta(current.key_frames_encoded, previous.key_frames_encoded),
            delta(current.qp_sum, previous.qp_sum),
        ),
        _ => return,
    };

    target.fps = Some(per_second(frames, elapsed_ms));
    target.qpf = Some(ratio(qp_sum, frames));
    target.keyframe_rate = Some(per_second(keyframes, elapsed_ms));
}

/// Concealment, silent concealment, acceleration and deceleration ratios of
/// received audio.
pub fn extract_audio(
    target: &mut SsrcMetrics,
    current: &StatRecord,
    previous: Option<&StatRecord>,
    _elapsed_ms: f64,
    _report: &StatsReport,
) {
    let (StatRecord::InboundRtp(current), Some(StatRecord::InboundRtp(previous))) =
        (current, previous)
    else {
        return;
    };

    let samples = delta(
        current.total_samples_received,
        previous.total_samples_received,
    );
    target.concealment_ratio = Some(ratio(
        delta(current.concealed_samples, previous.concealed_samples),
        samples,
    ));
    target.silent_concealment_ratio = Some(ratio(
        delta(
            current.silent_concealed_samples,
            previous.silent_concealed_samples,
        ),
        samples,
    ));
    target.acceleration_ratio = Some(ratio(
        delta(
            current.removed_samples_for_acceleration,
            previous.removed_samples_for_acceleration,
        ),
        samples,
    ));
    target.deceleration_ratio = Some(ratio(
        delta(
            current.inserted_samples_for_deceleration,
            previous.inserted_samples_for_deceleration,
        ),
        samples,
    ));
}

pub fn extract_candidate_pair(
    target: &mut CandidatePairMetrics,
    current: &CandidatePairStats,
    previous: Option<&CandidatePairStats>,
    elapsed_ms: f64,
) {
    target.state = current.state.clone();
    target.round_trip_time = current.current_round_trip_time;
    target.available_outgoing_bitrate = current.available_outgoing_bitrate;

    match previous.filter(|_| elapsed_ms > 0.0) {
        Some(previous) => {
            target.bitrate_in = Some(bitrate(
                current.bytes_received,
                previous.bytes_received,
                elapsed_ms,
            ));
            target.bitrate_out = Some(bitrate(current.bytes_sent, previous.bytes_sent, elapsed_ms));
        }
        None => {
            target.bitrate_in = None;
            target.bitrate_out = None;
        }
    }
}

/// Run every applicable transform for one RTP record.
pub fn extract_ssrc_metrics(
    target: &mut SsrcMetrics,
    current: &StatRecord,
    previous: Option<&StatRecord>,
    elapsed_ms: f64,
    report: &StatsReport,
) {
    extract_info(target, current, report);

    let previous = previous.filter(|_| elapsed_ms > 0.0);
    if previous.is_none() {
        target.clear_rates();
    }

    extract_common(target, current, previous, elapsed_ms, report);
    match target.kind {
        Some(MediaKind::Video) => extract_video(target, current, previous, elapsed_ms, report),
        Some(MediaKind::Audio) => extract_audio(target, current, previous, elapsed_ms, report),
        None => (),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::types::{CodecStats, MediaSourceStats, RemoteInboundRtpStats};

    fn outbound(timestamp: f64, bytes_sent: u64) -> StatRecord {
        StatRecord::OutboundRtp(OutboundRtpStats {
            timestamp,
            ssrc: 1,
            kind: Some(MediaKind::Video),
            bytes_sent,
            ..Default::default()
        })
    }

    #[test]
    fn bitrate_matches_reference_value() {
        let report = StatsReport::new();
        let mut target = SsrcMetrics::default();

        extract_ssrc_metrics(
            &mut target,
            &outbound(2000.0, 50_000),
            Some(&outbound(0.0, 0)),
            2000.0,
            &report,
        );

        assert_eq!(target.bitrate, Some(200_000.0));
        assert_eq!(target.direction, Some(Direction::Out));
    }

    #[test]
    fn header_bytes_are_part_of_the_bitrate() {
        let previous = StatRecord::InboundRtp(InboundRtpStats {
            kind: Some(MediaKind::Audio),
            ..Default::default()
        });
        let current = StatRecord::InboundRtp(InboundRtpStats {
            kind: Some(MediaKind::Audio),
            bytes_received: 900,
            header_bytes_received: 100,
            ..Default::default()
        });
        let mut target = SsrcMetrics::default();

        extract_common(&mut target, &current, Some(&previous), 1000.0, &StatsReport::new());

        assert_eq!(target.bitrate, Some(8000.0));
    }

    #[test]
    fn inbound_loss_ratio_is_normalized_by_elapsed_time() {
        let previous = StatRecord::InboundRtp(InboundRtpStats {
            packets_received: 100,
            packets_lost: 0,
            ..Default::default()
        });
        let current = StatRecord::InboundRtp(InboundRtpStats {
            packets_received: 190,
            packets_lost: 10,
            ..Default::default()
        });
        let mut target = SsrcMetrics::default();

        extract_common(&mut target, &current, Some(&previous), 1000.0, &StatsReport::new());

        // 1000 × 10 / (10 + 90) / 1000
        let loss = target.packet_loss.unwrap();
        assert!((loss - 0.1).abs() < 1e-12);
        assert_eq!(target.packet_rate, Some(90.0));
    }

    #[test]
    fn jitter_buffer_delay_is_zero_without_emitted_samples() {
        let previous = StatRecord::InboundRtp(InboundRtpStats {
            jitter_buffer_delay: 1.0,
            jitter_buffer_emitted_count: 50,
            ..Default::default()
        });
        let current = StatRecord::InboundRtp(InboundRtpStats {
            jitter_buffer_delay: 1.5,
            jitter_buffer_emitted_count: 50,
            ..Default::default()
        });
        let mut target = SsrcMetrics::default();

        extract_common(&mut target, &current, Some(&previous), 1000.0, &StatsReport::new());
        assert_eq!(target.jitter_buffer_delay, Some(0.0));

        let current = StatRecord::InboundRtp(InboundRtpStats {
            jitter_buffer_delay: 2.0,
            jitter_buffer_emitted_count: 60,
            ..Default::default()
        });
        extract_common(&mut target, &current, Some(&previous), 1000.0, &StatsReport::new());
        assert_eq!(target.jitter_buffer_delay, Some(0.1));
    }

    #[test]
    fn outbound_loss_and_round_trip_come_from_remote_report() {
        let mut report = StatsReport::new();
        report.insert(
            "RI1".into(),
            StatRecord::RemoteInboundRtp(RemoteInboundRtpStats {
                ssrc: 1,
                fraction_lost: 0.05,
                round_trip_time: Some(0.12),
                jitter: 0.004,
                ..Default::default()
            }),
        );
        let current = StatRecord::OutboundRtp(OutboundRtpStats {
            ssrc: 1,
            remote_id: Some("RI1".into()),
            ..Default::default()
        });
        let mut target = SsrcMetrics::default();

        extract_common(&mut target, &current, None, 0.0, &report);

        assert_eq!(target.fraction_lost, Some(0.05));
        assert_eq!(target.round_trip_time, Some(0.12));
        assert_eq!(target.jitter, Some(0.004));
        assert_eq!(target.bitrate, None);

        extract_common(&mut target, &current, None, 0.0, &StatsReport::new());

        assert_eq!(target.fraction_lost, None);
        assert_eq!(target.round_trip_time, None);
        assert_eq!(target.jitter, None);
    }

    #[test]
    fn video_frame_rate_and_qp_per_frame() {
        let previous = StatRecord::InboundRtp(InboundRtpStats {
            frames_decoded: 100,
            key_frames_decoded: 1,
            qp_sum: 2_000,
            ..Default::default()
        });
        let current = StatRecord::InboundRtp(InboundRtpStats {
            frames_decoded: 160,
            key_frames_decoded: 3,
            qp_sum: 3_800,
            ..Default::default()
        });
        let mut target = SsrcMetrics::default();

        extract_video(&mut target, &current, Some(&previous), 2000.0, &StatsReport::new());

        assert_eq!(target.fps, Some(30.0));
        assert_eq!(target.qpf, Some(30.0));
        assert_eq!(target.keyframe_rate, Some(1.0));
    }

    #[test]
    fn video_qp_per_frame_is_zero_without_frames() {
        let record = StatRecord::OutboundRtp(OutboundRtpStats {
            frames_encoded: 10,
            qp_sum: 300,
            ..Default::default()
        });
        let mut target = SsrcMetrics::default();

        extract_video(&mut target, &record, Some(&record), 1000.0, &StatsReport::new());

        assert_eq!(target.fps, Some(0.0));
        assert_eq!(target.qpf, Some(0.0));
    }

    #[test]
    fn audio_concealment_ratios() {
        let previous = StatRecord::InboundRtp(InboundRtpStats {
            total_samples_received: 48_000,
            ..Default::default()
        });
        let current = StatRecord::InboundRtp(InboundRtpStats {
            total_samples_received: 96_000,
            concealed_samples: 4_800,
            silent_concealed_samples: 480,
            removed_samples_for_acceleration: 960,
            inserted_samples_for_deceleration: 2_400,
            ..Default::default()
        });
        let mut target = SsrcMetrics::default();

        extract_audio(&mut target, &current, Some(&previous), 1000.0, &StatsReport::new());

        assert_eq!(target.concealment_ratio, Some(0.1));
        assert_eq!(target.silent_concealment_ratio, Some(0.01));
        assert_eq!(target.acceleration_ratio, Some(0.02));
        assert_eq!(target.deceleration_ratio, Some(0.05));

        extract_audio(&mut target, &previous, Some(&previous), 1000.0, &StatsReport::new());
        assert_eq!(target.concealment_ratio, Some(0.0));
    }

    #[test]
    fn candidate_pair_bitrates() {
        let previous = CandidatePairStats {
            bytes_sent: 0,
            bytes_received: 0,
            ..Default::default()
        };
        let current = CandidatePairStats {
            bytes_sent: 25_000,
            bytes_received: 50_000,
            current_round_trip_time: Some(0.05),
            ..Default::default()
        };
        let mut target = CandidatePairMetrics::default();

        extract_candidate_pair(&mut target, &current, Some(&previous), 2000.0);

        assert_eq!(target.bitrate_in, Some(200_000.0));
        assert_eq!(target.bitrate_out, Some(100_000.0));
        assert_eq!(target.round_trip_time, Some(0.05));

        extract_candidate_pair(&mut target, &current, None, 2000.0);
        assert_eq!(target.bitrate_in, None);
    }

    #[test]
    fn missing_previous_clears_rates_but_keeps_identity() {
        let mut report = StatsReport::new();
        report.insert(
            "C1".into(),
            StatRecord::Codec(CodecStats {
                mime_type: "video/VP8".into(),
                clock_rate: Some(90_000),
                ..Default::default()
            }),
        );
        report.insert(
            "MS1".into(),
            StatRecord::MediaSource(MediaSourceStats {
                track_identifier: Some("cam".into()),
                height: Some(720),
                ..Default::default()
            }),
        );
        let current = StatRecord::OutboundRtp(OutboundRtpStats {
            ssrc: 7,
            codec_id: Some("C1".into()),
            media_source_id: Some("MS1".into()),
            ..Default::default()
        });
        let mut target = SsrcMetrics {
            bitrate: Some(1.0),
            fps: Some(30.0),
            ..Default::default()
        };

        extract_ssrc_metrics(&mut target, &current, None, 2000.0, &report);

        assert_eq!(target.kind, Some(MediaKind::Video));
        assert_eq!(target.codec.as_deref(), Some("video/VP8/90000"));
        assert_eq!(target.track_id.as_deref(), Some("cam"));
        assert_eq!(target.height, Some(720));
        assert_eq!(target.bitrate, None);
        assert_eq!(target.fps, None);
    }
}
