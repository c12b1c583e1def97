//! Built-in gradient rules. Each file registers its rules into [`super::GRAD_RULES`].

mod elementwise;
mod gather;
mod matmul;
mod no_grad;
mod reduce;
