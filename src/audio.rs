use crate::config::Config;
use anyhow::Result;
use mp3lame_encoder::{Bitrate, Builder, FlushNoGap, InterleavedPcm, MonoPcm, Quality};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio_util::sync::CancellationToken;

/// MP3 が扱える最大チャンネル数
const MAX_OUTPUT_CHANNELS: u16 = 2;

/// リサンプラに 1 回で渡す入力フレーム数
const RESAMPLE_CHUNK_FRAMES: usize = 1024;

/// デコード済みの音声（インターリーブされた f32 サンプル）
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTrack {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioTrack {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// 結合済み音声
/// - 最初のトラックのサンプリングレート/チャンネル数を基準とする
/// - 以降のトラックは基準に合わせて変換し、末尾に連結する（ミックスはしない）
#[derive(Debug, Clone)]
pub struct MergedAudio {
    track: AudioTrack,
    segments: Vec<(usize, usize)>,
}

impl MergedAudio {
    pub fn from_first(track: AudioTrack) -> Self {
        let track = limit_channels(track);
        let segments = vec![(0, track.frames())];
        Self { track, segments }
    }

    /// トラックを末尾に追加
    pub fn append(&mut self, track: AudioTrack, cancel: &CancellationToken) -> Result<()> {
        let track = self.conform(track, cancel)?;
        let start = self.track.frames();
        self.segments.push((start, track.frames()));
        self.track.samples.extend_from_slice(&track.samples);
        Ok(())
    }

    /// 基準フォーマットへ変換（チャンネル数 → サンプリングレートの順）
    fn conform(&self, track: AudioTrack, cancel: &CancellationToken) -> Result<AudioTrack> {
        let track = limit_channels(track);
        let target_channels = self.track.channels;
        let target_rate = self.track.sample_rate;

        let samples = convert_channels(&track.samples, track.channels, target_channels);
        let samples = if track.sample_rate != target_rate {
            resample_interleaved(samples, target_channels, track.sample_rate, target_rate, cancel)?
        } else {
            samples
        };

        Ok(AudioTrack::new(samples, target_rate, target_channels))
    }

    pub fn track(&self) -> &AudioTrack {
        &self.track
    }

    /// 各入力トラックの (開始フレーム, フレーム数)
    pub fn segments(&self) -> &[(usize, usize)] {
        &self.segments
    }

    pub fn duration_seconds(&self) -> f64 {
        self.track.duration_seconds()
    }
}

/// 音声のデコード・結合・エンコードを担当
/// - キャンセルされるとファイル/パケット/チャンクの区切りで処理を打ち切る
pub struct AudioProcessor {
    bitrate_kbps: u32,
    encode_chunk_frames: usize,
    cancel: CancellationToken,
}

impl AudioProcessor {
    pub fn new(config: &Config) -> Self {
        Self {
            bitrate_kbps: config.audio.bitrate_kbps,
            encode_chunk_frames: config.audio.encode_chunk_frames,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// ファイルを入力順にデコードして連結する
    pub fn merge_files<P: AsRef<Path>>(&self, paths: &[P]) -> Result<MergedAudio> {
        let (first, rest) = paths
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("結合する音声ファイルがありません"))?;

        let mut merged = MergedAudio::from_first(self.load_audio_file(first)?);
        for path in rest {
            ensure_active(&self.cancel)?;
            let track = self.load_audio_file(path)?;
            merged.append(track, &self.cancel)?;
        }

        Ok(merged)
    }

    /// 音声ファイルをデコードして AudioTrack を返す
    pub fn load_audio_file<P: AsRef<Path>>(&self, file_path: P) -> Result<AudioTrack> {
        let path = file_path.as_ref();
        if !path.exists() {
            return Err(anyhow::anyhow!(
                "音声ファイルが見つかりません: {}",
                path.display()
            ));
        }

        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
            hint.with_extension(extension);
        }

        let meta_opts: MetadataOptions = Default::default();
        let fmt_opts: FormatOptions = Default::default();

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &fmt_opts, &meta_opts)
            .map_err(|e| anyhow::anyhow!("音声形式を判別できません ({}): {}", path.display(), e))?;
        let mut format = probed.format;

        let (track_id, codec_params) = {
            let track = format
                .tracks()
                .iter()
                .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
                .ok_or_else(|| anyhow::anyhow!("音声トラックが見つかりません"))?;

            (track.id, track.codec_params.clone())
        };

        let dec_opts: DecoderOptions = Default::default();
        let mut decoder = symphonia::default::get_codecs().make(&codec_params, &dec_opts)?;

        let mut samples = Vec::new();
        let mut sample_rate = codec_params.sample_rate;
        let mut channels = codec_params.channels.map(|ch| ch.count() as u16);
        let mut skipped_packets = 0usize;

        loop {
            ensure_active(&self.cancel)?;

            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(symphonia::core::errors::Error::ResetRequired) => break,
                Err(symphonia::core::errors::Error::IoError(ref err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(err) => return Err(anyhow::anyhow!("パケット読み込みエラー: {}", err)),
            };

            if packet.track_id() != track_id {
                continue;
            }

            match decoder.decode(&packet) {
                Ok(audio_buf) => {
                    let spec = *audio_buf.spec();
                    sample_rate = Some(spec.rate);
                    channels = Some(spec.channels.count() as u16);

                    let mut sample_buf = SampleBuffer::<f32>::new(audio_buf.capacity() as u64, spec);
                    sample_buf.copy_interleaved_ref(audio_buf);
                    samples.extend_from_slice(sample_buf.samples());
                }
                Err(symphonia::core::errors::Error::DecodeError(msg)) => {
                    // 壊れたフレームは読み飛ばす
                    skipped_packets += 1;
                    log::debug!("破損パケットをスキップ ({}): {}", path.display(), msg);
                }
                Err(symphonia::core::errors::Error::IoError(ref err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(err) => return Err(anyhow::anyhow!("デコードエラー: {}", err)),
            }
        }

        if skipped_packets > 0 {
            log::warn!(
                "{} 個の破損パケットをスキップしました: {}",
                skipped_packets,
                path.display()
            );
        }

        if samples.is_empty() {
            return Err(anyhow::anyhow!("音声データが空です: {}", path.display()));
        }

        let sample_rate =
            sample_rate.ok_or_else(|| anyhow::anyhow!("サンプリングレートが取得できません"))?;
        let channels = channels
            .filter(|&c| c > 0)
            .ok_or_else(|| anyhow::anyhow!("チャンネル数が取得できません"))?;

        Ok(AudioTrack::new(samples, sample_rate, channels))
    }

    /// MP3 にエンコードしてファイルへ書き出す。書き込んだバイト数を返す
    pub fn encode_to_file<P: AsRef<Path>>(&self, merged: &MergedAudio, output: P) -> Result<u64> {
        let encoded = encode_mp3(
            merged.track(),
            self.bitrate_kbps,
            self.encode_chunk_frames,
            &self.cancel,
        )?;
        std::fs::write(output.as_ref(), &encoded).map_err(|e| {
            anyhow::anyhow!("出力ファイルの書き込みに失敗: {} - {}", output.as_ref().display(), e)
        })?;
        Ok(encoded.len() as u64)
    }
}

// =============================================================================
// Conversion
// =============================================================================

fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(anyhow::anyhow!("処理が中断されました"));
    }
    Ok(())
}

/// 3ch 以上の音声は先頭 2ch（フロント L/R）のみ残す
fn limit_channels(track: AudioTrack) -> AudioTrack {
    if track.channels <= MAX_OUTPUT_CHANNELS {
        return track;
    }

    let samples = convert_channels(&track.samples, track.channels, MAX_OUTPUT_CHANNELS);
    AudioTrack::new(samples, track.sample_rate, MAX_OUTPUT_CHANNELS)
}

/// インターリーブ済みサンプルのチャンネル数を変換
pub fn convert_channels(samples: &[f32], from: u16, to: u16) -> Vec<f32> {
    let from = from as usize;
    let to = to as usize;
    if from == to || from == 0 || to == 0 {
        return samples.to_vec();
    }

    let mut out = Vec::with_capacity(samples.len() / from * to);
    for frame in samples.chunks_exact(from) {
        match (from, to) {
            (1, _) => out.extend(std::iter::repeat(frame[0]).take(to)),
            (_, 1) => out.push(frame.iter().sum::<f32>() / from as f32),
            _ => {
                for c in 0..to {
                    out.push(frame.get(c).copied().unwrap_or(0.0));
                }
            }
        }
    }
    out
}

/// インターリーブ済みサンプルをリサンプリング
/// - フィルタの遅延分を先頭から取り除き、末尾はフラッシュして長さを `frames * ratio` に揃える
pub fn resample_interleaved(
    samples: Vec<f32>,
    channels: u16,
    input_rate: u32,
    output_rate: u32,
    cancel: &CancellationToken,
) -> Result<Vec<f32>> {
    let channels = channels as usize;
    if input_rate == output_rate || channels == 0 || samples.len() < channels {
        return Ok(samples);
    }

    let frames = samples.len() / channels;
    let ratio = output_rate as f64 / input_rate as f64;

    // チャンネルごとに分離
    let mut planar = vec![Vec::with_capacity(frames); channels];
    for frame in samples.chunks_exact(channels) {
        for (c, &s) in frame.iter().enumerate() {
            planar[c].push(s);
        }
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler =
        SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK_FRAMES, channels)?;

    let delay = resampler.output_delay();
    let expected = (frames as f64 * ratio).round() as usize;
    let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + delay); channels];

    let mut pos = 0;
    while pos < frames {
        ensure_active(cancel)?;

        let needed = resampler.input_frames_next();
        let end = (pos + needed).min(frames);
        let chunk: Vec<&[f32]> = planar.iter().map(|ch| &ch[pos..end]).collect();
        let processed = if end - pos == needed {
            resampler.process(chunk.as_slice(), None)?
        } else {
            resampler.process_partial(Some(chunk.as_slice()), None)?
        };
        for (out, ch) in output.iter_mut().zip(processed) {
            out.extend_from_slice(&ch);
        }
        pos = end;
    }

    // 遅延分の末尾を吐き出させる
    while output[0].len() < delay + expected {
        ensure_active(cancel)?;

        let processed = resampler.process_partial(None::<&[Vec<f32>]>, None)?;
        if processed[0].is_empty() {
            break;
        }
        for (out, ch) in output.iter_mut().zip(processed) {
            out.extend_from_slice(&ch);
        }
    }

    // 遅延を除いて再度インターリーブ
    let available = output.iter().map(|ch| ch.len()).min().unwrap_or(0);
    let end = (delay + expected).min(available);
    let start = delay.min(end);
    let mut interleaved = Vec::with_capacity((end - start) * channels);
    for i in start..end {
        for ch in &output {
            interleaved.push(ch[i]);
        }
    }

    Ok(interleaved)
}

// =============================================================================
// Encoding
// =============================================================================

/// kbps 値を LAME のビットレートに変換（非対応の値はエラー）
pub fn bitrate_from_kbps(kbps: u32) -> Result<Bitrate> {
    let bitrate = match kbps {
        8 => Bitrate::Kbps8,
        16 => Bitrate::Kbps16,
        24 => Bitrate::Kbps24,
        32 => Bitrate::Kbps32,
        40 => Bitrate::Kbps40,
        48 => Bitrate::Kbps48,
        64 => Bitrate::Kbps64,
        80 => Bitrate::Kbps80,
        96 => Bitrate::Kbps96,
        112 => Bitrate::Kbps112,
        128 => Bitrate::Kbps128,
        160 => Bitrate::Kbps160,
        192 => Bitrate::Kbps192,
        224 => Bitrate::Kbps224,
        256 => Bitrate::Kbps256,
        320 => Bitrate::Kbps320,
        other => return Err(anyhow::anyhow!("サポートされていないビットレート: {}kbps", other)),
    };
    Ok(bitrate)
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// AudioTrack を MP3 バイト列にエンコード
pub fn encode_mp3(
    track: &AudioTrack,
    bitrate_kbps: u32,
    chunk_frames: usize,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    if track.channels == 0 || track.channels > MAX_OUTPUT_CHANNELS {
        return Err(anyhow::anyhow!(
            "MP3 に変換できないチャンネル数です: {}",
            track.channels
        ));
    }

    let mut builder =
        Builder::new().ok_or_else(|| anyhow::anyhow!("LAMEエンコーダの初期化に失敗しました"))?;
    builder
        .set_num_channels(track.channels as u8)
        .map_err(|e| anyhow::anyhow!("チャンネル数の設定に失敗: {:?}", e))?;
    builder
        .set_sample_rate(track.sample_rate)
        .map_err(|e| anyhow::anyhow!("サンプリングレートの設定に失敗: {:?}", e))?;
    builder
        .set_brate(bitrate_from_kbps(bitrate_kbps)?)
        .map_err(|e| anyhow::anyhow!("ビットレートの設定に失敗: {:?}", e))?;
    builder
        .set_quality(Quality::Good)
        .map_err(|e| anyhow::anyhow!("品質の設定に失敗: {:?}", e))?;
    let mut encoder = builder
        .build()
        .map_err(|e| anyhow::anyhow!("LAMEエンコーダの構築に失敗: {:?}", e))?;

    let channels = track.channels as usize;
    let pcm: Vec<i16> = track.samples.iter().map(|&s| to_i16(s)).collect();
    let mut output = Vec::new();

    for chunk in pcm.chunks(chunk_frames.max(1) * channels) {
        ensure_active(cancel)?;
        output.reserve(mp3lame_encoder::max_required_buffer_size(chunk.len() / channels));
        let result = if channels == 1 {
            encoder.encode_to_vec(MonoPcm(chunk), &mut output)
        } else {
            encoder.encode_to_vec(InterleavedPcm(chunk), &mut output)
        };
        result.map_err(|e| anyhow::anyhow!("エンコードエラー: {:?}", e))?;
    }

    output.reserve(mp3lame_encoder::max_required_buffer_size(0));
    encoder
        .flush_to_vec::<FlushNoGap>(&mut output)
        .map_err(|e| anyhow::anyhow!("エンコーダのフラッシュに失敗: {:?}", e))?;

    Ok(output)
}

// =============================================================================
// Utility Functions
// =============================================================================

/// ファイルサイズを人間が読みやすい形式で表示
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", size as u64, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
