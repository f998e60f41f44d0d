//! Cross-thread and end-to-end scenarios for the pipeline core.

#[cfg(test)]
mod bridge;

#[cfg(test)]
mod races;

#[cfg(test)]
mod reentrancy;
