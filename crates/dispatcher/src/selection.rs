use rand::Rng;

use scheduler_domain::Chooser;

/// 均匀随机选择，线程本地随机数生成器
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformChooser;

impl Chooser for UniformChooser {
    fn pick(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        Some(rand::rng().random_range(0..len))
    }
}
