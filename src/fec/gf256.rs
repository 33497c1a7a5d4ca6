//! GF(2^8) arithmetic over x^8 + x^4 + x^3 + x^2 + 1 (0x11D), generator 2.

/// Low byte of the field polynomial
const POLY: u8 = 0x1D;

struct Tables {
    exp: [u8; 512],
    log: [u8; 256],
}

const fn build_tables() -> Tables {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];

    let mut x: u8 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x;
        log[x as usize] = i as u8;
        let hi = x & 0x80;
        x <<= 1;
        if hi != 0 {
            x ^= POLY;
        }
        i += 1;
    }
    // Doubled so exp[log a + log b] never needs a modulo.
    while i < 512 {
        exp[i] = exp[i - 255];
        i += 1;
    }

    Tables { exp, log }
}

static TABLES: Tables = build_tables();

#[inline]
pub fn add(a: u8, b: u8) -> u8 {
    a ^ b
}

#[inline]
pub fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    TABLES.exp[TABLES.log[a as usize] as usize + TABLES.log[b as usize] as usize]
}

/// Multiplicative inverse; `inv(0)` is 0 by convention
#[inline]
pub fn inv(a: u8) -> u8 {
    if a == 0 {
        return 0;
    }
    TABLES.exp[255 - TABLES.log[a as usize] as usize]
}

#[inline]
pub fn div(a: u8, b: u8) -> u8 {
    mul(a, inv(b))
}

/// `dst[i] ^= coef * src[i]` over the shorter of the two slices
pub fn mul_acc(dst: &mut [u8], src: &[u8], coef: u8) {
    match coef {
        0 => {}
        1 => {
            for (d, s) in dst.iter_mut().zip(src) {
                *d ^= *s;
            }
        }
        _ => {
            let mut row = [0u8; 256];
            for (b, slot) in row.iter_mut().enumerate() {
                *slot = mul(coef, b as u8);
            }
            for (d, s) in dst.iter_mut().zip(src) {
                *d ^= row[*s as usize];
            }
        }
    }
}

/// Invert a square matrix (Gauss-Jordan). Returns `None` if singular.
pub fn invert_matrix(matrix: &[Vec<u8>]) -> Option<Vec<Vec<u8>>> {
    let n = matrix.len();
    let mut work: Vec<Vec<u8>> = matrix.to_vec();
    let mut out: Vec<Vec<u8>> = (0..n)
        .map(|i| {
            let mut row = vec![0u8; n];
            row[i] = 1;
            row
        })
        .collect();

    for col in 0..n {
        let pivot = (col..n).find(|&r| work[r][col] != 0)?;
        work.swap(col, pivot);
        out.swap(col, pivot);

        let scale = inv(work[col][col]);
        for j in 0..n {
            work[col][j] = mul(work[col][j], scale);
            out[col][j] = mul(out[col][j], scale);
        }

        for r in 0..n {
            if r == col || work[r][col] == 0 {
                continue;
            }
            let factor = work[r][col];
            let (pivot_work, pivot_out) = (work[col].clone(), out[col].clone());
            mul_acc(&mut work[r], &pivot_work, factor);
            mul_acc(&mut out[r], &pivot_out, factor);
        }
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverse_table() {
        for a in 1..=255u8 {
            assert_eq!(mul(a, inv(a)), 1, "a={}", a);
        }
    }

    #[test]
    fn test_known_products() {
        // 0x80 * 2 overflows and reduces by 0x1D
        assert_eq!(mul(0x80, 2), 0x1D);
        assert_eq!(mul(3, 7), 9);
        assert_eq!(mul(0, 0xAB), 0);
        assert_eq!(div(mul(0x53, 0xCA), 0xCA), 0x53);
    }

    #[test]
    fn test_mul_is_commutative_and_distributive() {
        for a in (0..=255u8).step_by(7) {
            for b in (0..=255u8).step_by(11) {
                assert_eq!(mul(a, b), mul(b, a));
                let c = 0x1F;
                assert_eq!(mul(a, add(b, c)), add(mul(a, b), mul(a, c)));
            }
        }
    }

    #[test]
    fn test_mul_acc() {
        let mut dst = vec![1u8, 2, 3];
        mul_acc(&mut dst, &[4, 5, 6], 1);
        assert_eq!(dst, vec![5, 7, 5]);

        let mut dst = vec![0u8; 3];
        mul_acc(&mut dst, &[1, 2, 3], 9);
        assert_eq!(dst, vec![mul(9, 1), mul(9, 2), mul(9, 3)]);
    }

    #[test]
    fn test_invert_matrix() {
        let m = vec![vec![1, 2, 3], vec![0, 1, 4], vec![5, 6, 0]];
        let inv_m = invert_matrix(&m).unwrap();

        for i in 0..3 {
            for j in 0..3 {
                let mut acc = 0u8;
                for k in 0..3 {
                    acc ^= mul(m[i][k], inv_m[k][j]);
                }
                assert_eq!(acc, (i == j) as u8);
            }
        }

        let singular = vec![vec![1, 1], vec![1, 1]];
        assert!(invert_matrix(&singular).is_none());
    }
}
