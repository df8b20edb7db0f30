//! The compositing operators applied per (input, output) pair each tick.
//!
//! Video uses pre-multiplied alpha "over": source colour channels are
//! already scaled by alpha, so the operator is an add plus an attenuation of
//! the destination. The attenuation factor is `256 - source_alpha`, giving
//! the range 1..=256 so the division stays a cheap shift; the resulting
//! off-by-one versus the canonical `255 - alpha` is a behavioural contract —
//! live content was authored against it and it must not be "fixed".
//!
//! Audio is a plain sum with two's-complement wrap. Overload is the
//! producer's responsibility.

use crate::frame::Frame;

/// Composite `src` over `dst` in place: alpha-over video, summed audio.
pub fn alpha_over(dst: &mut Frame, src: &Frame) {
    alpha_over_video(&mut dst.video, &src.video);
    mix_audio(&mut dst.audio, &src.audio);
}

fn alpha_over_video(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    for (dst_px, src_px) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
        let factor = 256 - u32::from(src_px[3]);
        for (d, &s) in dst_px.iter_mut().zip(src_px.iter()) {
            *d = (u32::from(s) + u32::from(*d) * factor / 256).min(255) as u8;
        }
    }
}

fn mix_audio(dst: &mut [i32], src: &[i32]) {
    for (d, &s) in dst.iter_mut().zip(src.iter()) {
        *d = d.wrapping_add(s);
    }
}
