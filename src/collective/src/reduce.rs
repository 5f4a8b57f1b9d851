//! Element-wise reduction operators over packed byte buffers.

use serde::{Deserialize, Serialize};

/// `dst[i] = op(dst[i], src[i])` for every element packed in the two slices.
pub type ReduceFn = fn(dst: &mut [u8], src: &[u8]);

pub trait Element: Copy + PartialOrd + std::fmt::Debug {
    const SIZE: usize;
    fn read(bytes: &[u8]) -> Self;
    fn write(self, bytes: &mut [u8]);
    fn add(self, rhs: Self) -> Self;
    fn mul(self, rhs: Self) -> Self;
}

macro_rules! impl_element_for {
    (int: $($ty:ty),+ $(,)?) => (
        $(impl Element for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();
            #[inline]
            fn read(bytes: &[u8]) -> Self {
                let mut a = [0u8; std::mem::size_of::<$ty>()];
                a.copy_from_slice(&bytes[..Self::SIZE]);
                <$ty>::from_ne_bytes(a)
            }
            #[inline]
            fn write(self, bytes: &mut [u8]) {
                bytes[..Self::SIZE].copy_from_slice(&self.to_ne_bytes());
            }
            #[inline]
            fn add(self, rhs: Self) -> Self {
                self.wrapping_add(rhs)
            }
            #[inline]
            fn mul(self, rhs: Self) -> Self {
                self.wrapping_mul(rhs)
            }
        })+
    );
    (float: $($ty:ty),+ $(,)?) => (
        $(impl Element for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();
            #[inline]
            fn read(bytes: &[u8]) -> Self {
                let mut a = [0u8; std::mem::size_of::<$ty>()];
                a.copy_from_slice(&bytes[..Self::SIZE]);
                <$ty>::from_ne_bytes(a)
            }
            #[inline]
            fn write(self, bytes: &mut [u8]) {
                bytes[..Self::SIZE].copy_from_slice(&self.to_ne_bytes());
            }
            #[inline]
            fn add(self, rhs: Self) -> Self {
                self + rhs
            }
            #[inline]
            fn mul(self, rhs: Self) -> Self {
                self * rhs
            }
        })+
    );
}

impl_element_for!(int: i32, i64, u32, u64);
impl_element_for!(float: f32, f64);

#[inline]
fn apply<T: Element, F: Fn(T, T) -> T>(dst: &mut [u8], src: &[u8], f: F) {
    assert_eq!(dst.len(), src.len());
    for (d, s) in dst.chunks_exact_mut(T::SIZE).zip(src.chunks_exact(T::SIZE)) {
        f(T::read(d), T::read(s)).write(d);
    }
}

pub fn sum<T: Element>(dst: &mut [u8], src: &[u8]) {
    apply::<T, _>(dst, src, T::add)
}

pub fn prod<T: Element>(dst: &mut [u8], src: &[u8]) {
    apply::<T, _>(dst, src, T::mul)
}

pub fn max<T: Element>(dst: &mut [u8], src: &[u8]) {
    apply::<T, _>(dst, src, |a, b| if b > a { b } else { a })
}

pub fn min<T: Element>(dst: &mut [u8], src: &[u8]) {
    apply::<T, _>(dst, src, |a, b| if b < a { b } else { a })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Prod,
    Max,
    Min,
}

impl Default for ReduceOp {
    fn default() -> Self {
        ReduceOp::Sum
    }
}

impl ReduceOp {
    pub fn reduce_fn<T: Element>(self) -> ReduceFn {
        match self {
            ReduceOp::Sum => sum::<T>,
            ReduceOp::Prod => prod::<T>,
            ReduceOp::Max => max::<T>,
            ReduceOp::Min => min::<T>,
        }
    }

    /// The same operator applied to two values, for sequential reference results.
    pub fn combine<T: Element>(self, a: T, b: T) -> T {
        match self {
            ReduceOp::Sum => a.add(b),
            ReduceOp::Prod => a.mul(b),
            ReduceOp::Max => {
                if b > a {
                    b
                } else {
                    a
                }
            }
            ReduceOp::Min => {
                if b < a {
                    b
                } else {
                    a
                }
            }
        }
    }
}

pub fn encode<T: Element>(values: &[T]) -> Vec<u8> {
    let mut buf = vec![0u8; values.len() * T::SIZE];
    for (v, chunk) in values.iter().zip(buf.chunks_exact_mut(T::SIZE)) {
        v.write(chunk);
    }
    buf
}

pub fn decode<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes.chunks_exact(T::SIZE).map(T::read).collect()
}
