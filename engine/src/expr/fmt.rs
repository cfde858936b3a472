use std::fmt;

use super::Expr;

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::True => write!(f, "true"),
            Expr::False => write!(f, "false"),
            Expr::BitVec { bits, size } => write!(f, "{}bv{}", bits, size),
            Expr::ConcreteRef(addr) => write!(f, "0x{:x}", addr),
            Expr::NullRef => write!(f, "null"),
            Expr::Symbol { id, sort } => write!(f, "${}:{}", id, sort),
            Expr::Not(e) => write!(f, "(not {})", e),
            Expr::And(l, r) => write!(f, "({} & {})", l, r),
            Expr::Or(l, r) => write!(f, "({} | {})", l, r),
            Expr::Eq(l, r) => write!(f, "({} == {})", l, r),
            Expr::ULe(l, r) => write!(f, "({} <= {})", l, r),
            Expr::Add(l, r) => write!(f, "({} + {})", l, r),
            Expr::Sub(l, r) => write!(f, "({} - {})", l, r),
            Expr::Ite { cond, then, otherwise } => {
                write!(f, "(ite {} {} {})", cond, then, otherwise)
            }
            Expr::BaseRead { collection, key } => {
                write!(f, "{}[", collection)?;
                for (i, k) in key.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", k)?;
                }
                write!(f, "]")
            }
        }
    }
}
