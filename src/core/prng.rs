// Seeded PRNG used for weight initialization.
//
// This is NOT cryptographically secure.
// Reproducibility matters more than quality: the same seed always builds the
// same hierarchy.

/// A source of uniform floats in `[0, 1)`.
///
/// Constructors take `&mut impl WeightRng` so callers can thread their own
/// generator through; [`Prng`] is the bundled implementation.
pub trait WeightRng {
    fn next_f32_01(&mut self) -> f32;

    #[inline]
    fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32_01()
    }
}

#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        // splitmix64 scramble so nearby seeds give unrelated streams.
        let mut z = seed.wrapping_add(0x9E3779B97F4A7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^= z >> 31;

        // Avoid a zero state.
        let state = if z == 0 { 0x9E3779B97F4A7C15 } else { z };
        Self { state }
    }

    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }
}

impl WeightRng for Prng {
    #[inline]
    fn next_f32_01(&mut self) -> f32 {
        // Top 24 bits fit the f32 mantissa exactly.
        (self.next_u64() >> 40) as f32 / (1u32 << 24) as f32
    }
}
