use rand::{rngs::StdRng, Rng, SeedableRng};

/**
 * \brief 随机源：所有带随机性的决策都经由它，测试时可替换为固定序列。
 */
pub trait Dice: Send {
    /** \brief 50% 概率的抛硬币 */
    fn flip(&mut self) -> bool;
    /** \brief 返回 [0, upper) 内的整数 */
    fn roll(&mut self, upper: u32) -> u32;
}

/**
 * \brief 默认随机源，基于 StdRng。
 */
pub struct StdDice(StdRng);

impl StdDice {
    pub fn from_entropy() -> Self {
        Self(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}

impl Default for StdDice {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl Dice for StdDice {
    fn flip(&mut self) -> bool {
        self.0.gen_bool(0.5)
    }

    fn roll(&mut self, upper: u32) -> u32 {
        if upper == 0 {
            0
        } else {
            self.0.gen_range(0..upper)
        }
    }
}

/**
 * \brief 自由发言采样策略：抽到的点数小于频率百分比即回复。
 */
pub fn should_auto_reply(freq_percent: u8, draw: u32) -> bool {
    draw < u32::from(freq_percent)
}
