use crate::cancellations::DownsellVariant;

/// 50/50 draw, decided once per case at creation time. The draw happens
/// before the insert; a lost insert race discards the drawn value with it.
pub fn draw_variant() -> DownsellVariant {
    use rand::Rng;

    if rand::rng().random::<bool>() {
        DownsellVariant::A
    } else {
        DownsellVariant::B
    }
}
