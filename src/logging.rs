// macros only; no direct imports needed

/// `tracing::info!` correlated with the run's instance id and orchestration name.
#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        ::tracing::info!(
            target: "duroxide_sim::orchestration",
            instance_id = %$ctx.instance_id(),
            orchestration_name = %$ctx.orchestration_name(),
            $($arg)+
        );
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        ::tracing::warn!(
            target: "duroxide_sim::orchestration",
            instance_id = %$ctx.instance_id(),
            orchestration_name = %$ctx.orchestration_name(),
            $($arg)+
        );
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        ::tracing::error!(
            target: "duroxide_sim::orchestration",
            instance_id = %$ctx.instance_id(),
            orchestration_name = %$ctx.orchestration_name(),
            $($arg)+
        );
    }};
}
